use std::collections::HashMap;
use std::error::Error;

use bytes::BytesMut;
use secp256k1::{PublicKey, Secp256k1, SecretKey};

use super::handshake::HandshakeNew;

#[test]
fn test_bolt0008() {
    test_bolt0008_internal().unwrap();
}

// The complete BOLT #8 test vector: act bytes, derived session keys, and
// the transport-message ciphertexts across two key rotations.
fn test_bolt0008_internal() -> Result<(), Box<dyn Error>> {
    let secp = Secp256k1::new();

    let rs_priv = SecretKey::from_slice(
        hex::decode("2121212121212121212121212121212121212121212121212121212121212121")?
            .as_slice(),
    )?;
    let rs_pub = PublicKey::from_secret_key(&secp, &rs_priv);
    assert_eq!(
        hex::encode(&rs_pub.serialize()[..]),
        "028d7500dd4c12685d1f568b4c2b5048e8534b873319f3a8daa612b469132ec7f7"
    );

    let ls_priv = SecretKey::from_slice(
        hex::decode("1111111111111111111111111111111111111111111111111111111111111111")?
            .as_slice(),
    )?;
    let ls_pub = PublicKey::from_secret_key(&secp, &ls_priv);
    assert_eq!(
        hex::encode(&ls_pub.serialize()[..]),
        "034f355bdcb7cc0af728ef3cceb9615d90684bb5b2ca5f859ab0f0b704075871aa"
    );

    let e_priv = SecretKey::from_slice(
        hex::decode("1212121212121212121212121212121212121212121212121212121212121212")?
            .as_slice(),
    )?;
    let e_pub = PublicKey::from_secret_key(&secp, &e_priv);
    assert_eq!(
        hex::encode(&e_pub.serialize()[..]),
        "036360e856310ce5d294e8be33fc807077dc56ac80d95d9cd4ddbd21325eff73f7"
    );

    let mut machine = HandshakeNew::new(true, ls_priv, rs_pub)?;
    machine.ephemeral_gen = || {
        SecretKey::from_slice(
            hex::decode("1212121212121212121212121212121212121212121212121212121212121212")
                .unwrap()
                .as_slice(),
        )
    };
    assert_eq!(
        hex::encode(machine.handshake_digest()),
        "8401b3fdcaaa710b5405400536a3d5fd7792fe8e7fe29cd8b687216fe323ecbd"
    );

    let (act_one, machine) = machine.gen_act_one()?;
    assert_eq!(
        hex::encode(&act_one.bytes[..]),
        "00036360e856310ce5d294e8be33fc807077dc56ac80d95d9cd4ddbd21325eff73f70df6086551151f58b8afe6c195782c6a"
    );

    let mut responder_machine = HandshakeNew::new(false, rs_priv, ls_pub)?;
    responder_machine.ephemeral_gen = || {
        SecretKey::from_slice(
            hex::decode("2222222222222222222222222222222222222222222222222222222222222222")
                .unwrap()
                .as_slice(),
        )
    };

    let responder_machine = responder_machine.recv_act_one(act_one)?;

    let (act_two, responder_machine) = responder_machine.gen_act_two()?;
    assert_eq!(
        hex::encode(&act_two.bytes[..]),
        "0002466d7fcae563e5cb09a0d1870bb580344804617879a14949cf22285f1bae3f276e2470b93aac583c9ef6eafca3f730ae"
    );

    let machine = machine.recv_act_two(act_two)?;

    let (act_three, mut machine) = machine.gen_act_three()?;
    assert_eq!(
        hex::encode(&act_three.bytes[..]),
        "00b9e3a702e93e3a9948c2ed6e5fd7590a6e1c3a0344cfc9d5b57357049aa22355361aa02e55a8fc28fef5bd6d71ad0c38228dc68b1c466263b47fdf31e560e139ba"
    );

    let mut responder_machine = responder_machine.recv_act_three(act_three)?;

    let send_key = "969ab31b4d288cedf6218839b27a3e2140827047f2c0f01bf5c04435d43511a9";
    let recv_key = "bb9020b8965f4df047e07f955f3c4b88418984aadc5cdb35096b9ea8fa5c3442";
    let chain_key = "919219dbb2920afa8db80f9a51787a840bcf111ed8d588caf9ab4be716e42b01";

    assert_eq!(hex::encode(machine.send_cipher_key()), send_key);
    assert_eq!(hex::encode(machine.recv_cipher_key()), recv_key);
    assert_eq!(hex::encode(machine.chaining_key()), chain_key);

    assert_eq!(hex::encode(responder_machine.send_cipher_key()), recv_key);
    assert_eq!(hex::encode(responder_machine.recv_cipher_key()), send_key);
    assert_eq!(hex::encode(responder_machine.chaining_key()), chain_key);

    // Transport-message vectors: slightly more than 1000 messages so both
    // key rotations (at 500 and 1000 messages) are exercised.
    let mut transport_message_vectors = HashMap::new();
    transport_message_vectors.insert(
        0usize,
        "cf2b30ddf0cf3f80e7c35a6e6730b59fe802473180f396d88a8fb0db8cbcf25d2f214cf9ea1d95",
    );
    transport_message_vectors.insert(
        1,
        "72887022101f0b6753e0c7de21657d35a4cb2a1f5cde2650528bbc8f837d0f0d7ad833b1a256a1",
    );
    transport_message_vectors.insert(
        500,
        "178cb9d7387190fa34db9c2d50027d21793c9bc2d40b1e14dcf30ebeeeb220f48364f7a4c68bf8",
    );
    transport_message_vectors.insert(
        501,
        "1b186c57d44eb6de4c057c49940d79bb838a145cb528d6e8fd26dbe50a60ca2c104b56b60e45bd",
    );
    transport_message_vectors.insert(
        1000,
        "4a2f3cc3b5e78ddb83dcb426d9863d9d9a723b0337c89dd0b005d89f8d3c05c52b76b29b740f09",
    );
    transport_message_vectors.insert(
        1001,
        "2ecd8c8a5629d0d02ab457a0fdd0f7b90a192cd46be5ecb6ca570bfc5e268338b1a16cf4ef2d36",
    );

    let payload = b"hello";
    for i in 0..1002 {
        let mut buffer = BytesMut::with_capacity(0x100);
        machine.write_frame(payload, &mut buffer)?;

        if let Some(expected) = transport_message_vectors.get(&i) {
            let actual = hex::encode(&buffer[..]);
            assert_eq!(&actual, expected, "message {}", i);
        }

        // The responder decrypts every message, across rotations.
        let plaintext = machine_read(&mut responder_machine, &mut buffer)?;
        assert_eq!(plaintext, payload);
        assert!(buffer.is_empty());
    }

    Ok(())
}

fn machine_read(
    machine: &mut super::handshake::Machine,
    buffer: &mut BytesMut,
) -> Result<Vec<u8>, Box<dyn Error>> {
    match machine.read_frame(buffer)? {
        Some(payload) => Ok(payload),
        None => Err("expected a whole record".into()),
    }
}

#[test]
fn partial_records_are_reassembled() {
    let secp = Secp256k1::new();
    let ls_priv = SecretKey::from_slice(&[0x11; 32]).unwrap();
    let rs_priv = SecretKey::from_slice(&[0x21; 32]).unwrap();
    let rs_pub = PublicKey::from_secret_key(&secp, &rs_priv);
    let ls_pub = PublicKey::from_secret_key(&secp, &ls_priv);

    let initiator = HandshakeNew::new(true, ls_priv, rs_pub).unwrap();
    let responder = HandshakeNew::new(false, rs_priv, ls_pub).unwrap();

    let (act_one, initiator) = initiator.gen_act_one().unwrap();
    let responder = responder.recv_act_one(act_one).unwrap();
    let (act_two, responder) = responder.gen_act_two().unwrap();
    let initiator = initiator.recv_act_two(act_two).unwrap();
    let (act_three, mut alice) = initiator.gen_act_three().unwrap();
    let mut bob = responder.recv_act_three(act_three).unwrap();

    assert_eq!(alice.remote_static(), &rs_pub);
    assert_eq!(bob.remote_static(), &ls_pub);

    let mut wire = BytesMut::new();
    alice.write_frame(b"first", &mut wire).unwrap();
    alice.write_frame(b"second", &mut wire).unwrap();

    // Feed the receiver one byte at a time; two whole payloads must come
    // out, in order, despite the drip.
    let mut received = Vec::new();
    let mut buffer = BytesMut::new();
    for byte in wire.iter() {
        buffer.extend_from_slice(&[*byte]);
        while let Some(payload) = bob.read_frame(&mut buffer).unwrap() {
            received.push(payload);
        }
    }
    assert_eq!(received, vec![b"first".to_vec(), b"second".to_vec()]);
}
