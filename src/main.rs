use std::env;
use std::process::exit;

use secp256k1::{PublicKey, Secp256k1, SecretKey};
use tokio::net::TcpListener;

use channel::MemoryKeyManager;
use channel_machine::ChannelConfig;
use fulgurd::{
    responder_handshake, LogWatcher, MemoryChannelsDb, Peer, TcpTransport,
};
use wire::{CsvDelay, Hash256, MilliSatoshi, Satoshi};

fn node_seed() -> [u8; 32] {
    match env::var("FULGURD_SEED") {
        Ok(hex_seed) => {
            let raw = hex::decode(&hex_seed).unwrap_or_else(|_| {
                eprintln!("FULGURD_SEED must be 32 bytes of hex");
                exit(1);
            });
            let mut seed = [0; 32];
            if raw.len() != 32 {
                eprintln!("FULGURD_SEED must be 32 bytes of hex");
                exit(1);
            }
            seed.copy_from_slice(&raw);
            seed
        }
        Err(_) => rand::random(),
    }
}

fn default_config() -> ChannelConfig {
    ChannelConfig {
        chain_hash: Hash256::BITCOIN_CHAIN_HASH,
        dust_limit: Satoshi(546),
        max_htlc_value_in_flight: MilliSatoshi(5_000_000_000),
        channel_reserve: Satoshi(10_000),
        htlc_minimum: MilliSatoshi(1_000),
        to_self_delay: CsvDelay(144),
        max_accepted_htlcs: 30,
        minimum_depth: 3,
        // Replaced per-channel once a wallet collaborator is wired in.
        shutdown_script: hex::decode("0014ccf1af2f2aabee14bb40fa3851ab2301de843110")
            .expect("valid script hex"),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let listen = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9735".to_string());

    let seed = node_seed();
    let node_secret = SecretKey::from_slice(&channel::tools::sha256(
        &[&seed[..], &b"node"[..]].concat(),
    ))
    .expect("a hash is a valid key");
    let node_public = PublicKey::from_secret_key(&Secp256k1::new(), &node_secret);
    log::info!("node key {}", hex::encode(node_public.serialize()));

    let listener = match TcpListener::bind(&listen).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("cannot listen on {}: {}", listen, e);
            exit(1);
        }
    };
    log::info!("listening on {}", listen);

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("accept failed: {}", e);
                continue;
            }
        };
        log::info!("inbound connection from {}", remote_addr);

        let node_secret = node_secret;
        let seed = seed;
        tokio::spawn(async move {
            let mut transport = TcpTransport::new(stream);
            let machine = match responder_handshake(&mut transport, node_secret).await {
                Ok(machine) => machine,
                Err(e) => {
                    log::warn!("handshake with {} failed: {}", remote_addr, e);
                    return;
                }
            };
            log::info!(
                "peer {} authenticated as {}",
                remote_addr,
                hex::encode(machine.remote_static().serialize()),
            );

            let key_manager = match MemoryKeyManager::from_seed(seed) {
                Ok(key_manager) => key_manager,
                Err(e) => {
                    log::error!("cannot derive channel keys: {}", e);
                    return;
                }
            };
            let (peer, mut handle) = Peer::new(
                machine,
                transport,
                key_manager,
                LogWatcher,
                MemoryChannelsDb::default(),
                default_config(),
            );

            // Drain listener events so the peer never blocks on them.
            tokio::spawn(async move {
                while let Some(event) = handle.events.recv().await {
                    log::info!("peer event: {:?}", event);
                }
            });

            if let Err(e) = peer.run().await {
                log::warn!("peer {} terminated: {}", remote_addr, e);
            }
        });
    }
}
