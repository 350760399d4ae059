use crate::element::{Element, Index, MAX_HEIGHT, START_INDEX};
use crate::error::Error;

/// Stores the per-commitment secrets revealed by the counterparty in
/// O(log n) space. Each bucket holds the element whose index has exactly
/// that many trailing zero bits; an element regenerates every secret in its
/// sub-tree, so at most 49 of them cover all secrets ever inserted.
///
/// Secrets MUST be inserted in the order the counterparty's producer
/// emits them, starting at `START_INDEX` and decreasing by one.
#[derive(Clone, Debug)]
pub struct RevocationStore {
    len_buckets: u8,
    buckets: [Element; MAX_HEIGHT as usize + 1],
    next_index: Index,
}

impl Default for RevocationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RevocationStore {
    pub fn new() -> Self {
        RevocationStore {
            len_buckets: 0,
            buckets: [Element::default(); MAX_HEIGHT as usize + 1],
            next_index: START_INDEX,
        }
    }

    /// The index the next inserted secret must carry: `START_INDEX` for an
    /// empty store, one below the last accepted insert otherwise.
    pub fn expected_next(&self) -> Index {
        self.next_index
    }

    /// Number of secrets accepted so far.
    pub fn len(&self) -> u64 {
        START_INDEX.0 - self.next_index.0
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Accepts the next secret in the chain. Every already stored element
    /// which the new one claims to supersede must be re-derivable from it,
    /// otherwise the counterparty has revealed an inconsistent chain and
    /// `InvalidSecret` is returned with the store untouched.
    pub fn add_next_entry(&mut self, index: Index, hash: [u8; 32]) -> Result<(), Error> {
        if index != self.next_index {
            return Err(Error::OutOfOrder {
                index,
                expected: self.next_index,
            });
        }

        let new_element = Element { index, hash };
        let bucket = new_element.index.height();

        for i in 0..bucket {
            let e = new_element.derive(self.buckets[usize::from(i)].index)?;
            if e != self.buckets[usize::from(i)] {
                return Err(Error::InvalidSecret { index });
            }
        }

        self.buckets[usize::from(bucket)] = new_element;
        if bucket + 1 > self.len_buckets {
            self.len_buckets = bucket + 1;
        }

        self.next_index = Index(self.next_index.0 - 1);
        Ok(())
    }

    /// Recovers a previously inserted secret, or `None` when `index` lies
    /// outside every stored sub-tree.
    pub fn look_up(&self, index: Index) -> Option<[u8; 32]> {
        for i in 0..usize::from(self.len_buckets) {
            if self.buckets[i].can_derive(index) {
                // Derivation cannot fail once the prefix check passed.
                return self.buckets[i].derive(index).ok().map(|e| e.hash);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::RevocationProducer;

    struct TestInsert {
        index: Index,
        secret: &'static str,
        successful: bool,
    }

    struct TestData {
        name: &'static str,
        inserts: &'static [TestInsert],
    }

    // The insert sequences of BOLT #3 appendix D, the same table the
    // reference implementations carry.
    const TESTS: [TestData; 9] = [
        TestData {
            name: "insert_secret correct sequence",
            inserts: &[
                TestInsert {
                    index: Index(281474976710655),
                    secret: "7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710654),
                    secret: "c7518c8ae4660ed02894df8976fa1a3659c1a8b4b5bec0c4b872abeba4cb8964",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710653),
                    secret: "2273e227a5b7449b6e70f1fb4652864038b1cbf9cd7c043a7d6456b7fc275ad8",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710652),
                    secret: "27cddaa5624534cb6cb9d7da077cf2b22ab21e9b506fd4998a51d54502e99116",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710651),
                    secret: "c65716add7aa98ba7acb236352d665cab17345fe45b55fb879ff80e6bd0c41dd",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710650),
                    secret: "969660042a28f32d9be17344e09374b379962d03db1574df5a8a5a47e19ce3f2",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710649),
                    secret: "a5a64476122ca0925fb344bdc1854c1c0a59fc614298e50a33e331980a220f32",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710648),
                    secret: "05cde6323d949933f7f7b78776bcc1ea6d9b31447732e3802e1f7ac44b650e17",
                    successful: true,
                },
            ],
        },
        TestData {
            name: "insert_secret #1 incorrect",
            inserts: &[
                TestInsert {
                    index: Index(281474976710655),
                    secret: "02a40c85b6f28da08dfdbe0926c53fab2de6d28c10301f8f7c4073d5e42e3148",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710654),
                    secret: "c7518c8ae4660ed02894df8976fa1a3659c1a8b4b5bec0c4b872abeba4cb8964",
                    successful: false,
                },
            ],
        },
        TestData {
            name: "insert_secret #2 incorrect (#1 derived from incorrect)",
            inserts: &[
                TestInsert {
                    index: Index(281474976710655),
                    secret: "02a40c85b6f28da08dfdbe0926c53fab2de6d28c10301f8f7c4073d5e42e3148",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710654),
                    secret: "dddc3a8d14fddf2b68fa8c7fbad2748274937479dd0f8930d5ebb4ab6bd866a3",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710653),
                    secret: "2273e227a5b7449b6e70f1fb4652864038b1cbf9cd7c043a7d6456b7fc275ad8",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710652),
                    secret: "27cddaa5624534cb6cb9d7da077cf2b22ab21e9b506fd4998a51d54502e99116",
                    successful: false,
                },
            ],
        },
        TestData {
            name: "insert_secret #3 incorrect",
            inserts: &[
                TestInsert {
                    index: Index(281474976710655),
                    secret: "7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710654),
                    secret: "c7518c8ae4660ed02894df8976fa1a3659c1a8b4b5bec0c4b872abeba4cb8964",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710653),
                    secret: "c51a18b13e8527e579ec56365482c62f180b7d5760b46e9477dae59e87ed423a",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710652),
                    secret: "27cddaa5624534cb6cb9d7da077cf2b22ab21e9b506fd4998a51d54502e99116",
                    successful: false,
                },
            ],
        },
        TestData {
            name: "insert_secret #4 incorrect (1,2,3 derived from incorrect)",
            inserts: &[
                TestInsert {
                    index: Index(281474976710655),
                    secret: "02a40c85b6f28da08dfdbe0926c53fab2de6d28c10301f8f7c4073d5e42e3148",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710654),
                    secret: "dddc3a8d14fddf2b68fa8c7fbad2748274937479dd0f8930d5ebb4ab6bd866a3",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710653),
                    secret: "c51a18b13e8527e579ec56365482c62f180b7d5760b46e9477dae59e87ed423a",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710652),
                    secret: "ba65d7b0ef55a3ba300d4e87af29868f394f8f138d78a7011669c79b37b936f4",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710651),
                    secret: "c65716add7aa98ba7acb236352d665cab17345fe45b55fb879ff80e6bd0c41dd",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710650),
                    secret: "969660042a28f32d9be17344e09374b379962d03db1574df5a8a5a47e19ce3f2",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710649),
                    secret: "a5a64476122ca0925fb344bdc1854c1c0a59fc614298e50a33e331980a220f32",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710648),
                    secret: "05cde6323d949933f7f7b78776bcc1ea6d9b31447732e3802e1f7ac44b650e17",
                    successful: false,
                },
            ],
        },
        TestData {
            name: "insert_secret #5 incorrect",
            inserts: &[
                TestInsert {
                    index: Index(281474976710655),
                    secret: "7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710654),
                    secret: "c7518c8ae4660ed02894df8976fa1a3659c1a8b4b5bec0c4b872abeba4cb8964",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710653),
                    secret: "2273e227a5b7449b6e70f1fb4652864038b1cbf9cd7c043a7d6456b7fc275ad8",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710652),
                    secret: "27cddaa5624534cb6cb9d7da077cf2b22ab21e9b506fd4998a51d54502e99116",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710651),
                    secret: "631373ad5f9ef654bb3dade742d09504c567edd24320d2fcd68e3cc47e2ff6a6",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710650),
                    secret: "969660042a28f32d9be17344e09374b379962d03db1574df5a8a5a47e19ce3f2",
                    successful: false,
                },
            ],
        },
        TestData {
            name: "insert_secret #6 incorrect (5 derived from incorrect)",
            inserts: &[
                TestInsert {
                    index: Index(281474976710655),
                    secret: "7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710654),
                    secret: "c7518c8ae4660ed02894df8976fa1a3659c1a8b4b5bec0c4b872abeba4cb8964",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710653),
                    secret: "2273e227a5b7449b6e70f1fb4652864038b1cbf9cd7c043a7d6456b7fc275ad8",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710652),
                    secret: "27cddaa5624534cb6cb9d7da077cf2b22ab21e9b506fd4998a51d54502e99116",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710651),
                    secret: "631373ad5f9ef654bb3dade742d09504c567edd24320d2fcd68e3cc47e2ff6a6",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710650),
                    secret: "b7e76a83668bde38b373970155c868a653304308f9896692f904a23731224bb1",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710649),
                    secret: "a5a64476122ca0925fb344bdc1854c1c0a59fc614298e50a33e331980a220f32",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710648),
                    secret: "05cde6323d949933f7f7b78776bcc1ea6d9b31447732e3802e1f7ac44b650e17",
                    successful: false,
                },
            ],
        },
        TestData {
            name: "insert_secret #7 incorrect",
            inserts: &[
                TestInsert {
                    index: Index(281474976710655),
                    secret: "7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710654),
                    secret: "c7518c8ae4660ed02894df8976fa1a3659c1a8b4b5bec0c4b872abeba4cb8964",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710653),
                    secret: "2273e227a5b7449b6e70f1fb4652864038b1cbf9cd7c043a7d6456b7fc275ad8",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710652),
                    secret: "27cddaa5624534cb6cb9d7da077cf2b22ab21e9b506fd4998a51d54502e99116",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710651),
                    secret: "c65716add7aa98ba7acb236352d665cab17345fe45b55fb879ff80e6bd0c41dd",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710650),
                    secret: "969660042a28f32d9be17344e09374b379962d03db1574df5a8a5a47e19ce3f2",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710649),
                    secret: "e7971de736e01da8ed58b94c2fc216cb1dca9e326f3a96e7194fe8ea8af6c0a3",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710648),
                    secret: "05cde6323d949933f7f7b78776bcc1ea6d9b31447732e3802e1f7ac44b650e17",
                    successful: false,
                },
            ],
        },
        TestData {
            name: "insert_secret #8 incorrect",
            inserts: &[
                TestInsert {
                    index: Index(281474976710655),
                    secret: "7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710654),
                    secret: "c7518c8ae4660ed02894df8976fa1a3659c1a8b4b5bec0c4b872abeba4cb8964",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710653),
                    secret: "2273e227a5b7449b6e70f1fb4652864038b1cbf9cd7c043a7d6456b7fc275ad8",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710652),
                    secret: "27cddaa5624534cb6cb9d7da077cf2b22ab21e9b506fd4998a51d54502e99116",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710651),
                    secret: "c65716add7aa98ba7acb236352d665cab17345fe45b55fb879ff80e6bd0c41dd",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710650),
                    secret: "969660042a28f32d9be17344e09374b379962d03db1574df5a8a5a47e19ce3f2",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710649),
                    secret: "a5a64476122ca0925fb344bdc1854c1c0a59fc614298e50a33e331980a220f32",
                    successful: true,
                },
                TestInsert {
                    index: Index(281474976710648),
                    secret: "a7efbc61aac46d34f77778bac22c8a20c6a46ca460addc49009bda875ec88fa4",
                    successful: false,
                },
            ],
        },
    ];

    fn secret(s: &str) -> [u8; 32] {
        let mut out = [0; 32];
        out.copy_from_slice(&hex::decode(s).unwrap());
        out
    }

    #[test]
    fn insert_secret_reference_sequences() {
        for test in &TESTS {
            let mut store = RevocationStore::new();
            for insert in test.inserts {
                let result = store.add_next_entry(insert.index, secret(insert.secret));
                if result.is_err() && insert.successful {
                    panic!(
                        "{}: unexpected error at index {}: {}",
                        test.name,
                        insert.index.0,
                        result.unwrap_err(),
                    );
                } else if result.is_ok() && !insert.successful {
                    panic!("{}: expected error at index {}", test.name, insert.index.0);
                }
            }
        }
    }

    #[test]
    fn every_inserted_secret_is_recoverable() {
        let producer = RevocationProducer::new([0x42; 32]);
        let mut store = RevocationStore::new();

        let count = 64;
        for n in 0..count {
            let index = Index::from_commitment_number(n);
            store
                .add_next_entry(index, producer.at_index(n).unwrap())
                .unwrap();

            // All previously inserted secrets remain reachable.
            for m in 0..=n {
                let wanted = Index::from_commitment_number(m);
                assert_eq!(store.look_up(wanted), Some(producer.at_index(m).unwrap()));
            }
        }
        assert_eq!(store.len(), count);
    }

    #[test]
    fn look_up_unknown_index_is_none() {
        let producer = RevocationProducer::new([0x42; 32]);
        let mut store = RevocationStore::new();
        store
            .add_next_entry(Index::from_commitment_number(0), producer.at_index(0).unwrap())
            .unwrap();

        assert_eq!(store.look_up(Index::from_commitment_number(5)), None);
    }

    #[test]
    fn out_of_order_insert_is_rejected() {
        let producer = RevocationProducer::new([0x42; 32]);
        let mut store = RevocationStore::new();
        let err = store
            .add_next_entry(Index::from_commitment_number(1), producer.at_index(1).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::OutOfOrder { .. }));

        store
            .add_next_entry(Index::from_commitment_number(0), producer.at_index(0).unwrap())
            .unwrap();
        assert_eq!(store.expected_next(), Index::from_commitment_number(1));
    }
}
