use crate::error::Result;

use serde::{Deserialize, Serialize};

/// A key/value storage engine, where both keys and values are arbitrary byte
/// strings, stored in lexicographical key order. Writes are only guaranteed
/// durable after calling flush().
///
/// The Raft log is the only user of the engine, and it is owned by the single
/// node thread, so all methods (including reads) take a mutable reference.
pub trait Engine: Send {
    /// The iterator returned by scan().
    type ScanIterator<'a>: ScanIterator + 'a
    where
        Self: Sized + 'a; // omit in trait objects, for object safety

    /// Deletes a key, or does nothing if it does not exist.
    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// Flushes any buffered data to the underlying storage medium.
    fn flush(&mut self) -> Result<()>;

    /// Gets a value for a key, if it exists.
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Iterates over an ordered range of key/value pairs.
    fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_>
    where
        Self: Sized; // omit in trait objects, for object safety

    /// Like scan, but can be used from trait objects. The iterator will use
    /// dynamic dispatch, which has a minor performance penalty.
    fn scan_dyn(
        &mut self,
        range: (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>),
    ) -> Box<dyn ScanIterator + '_>;

    /// Iterates over all key/value pairs starting with prefix.
    fn scan_prefix(&mut self, prefix: &[u8]) -> Self::ScanIterator<'_>
    where
        Self: Sized, // omit in trait objects, for object safety
    {
        let start = std::ops::Bound::Included(prefix.to_vec());
        let end = match prefix.iter().rposition(|b| *b != 0xff) {
            Some(i) => std::ops::Bound::Excluded(
                prefix.iter().take(i).copied().chain(std::iter::once(prefix[i] + 1)).collect(),
            ),
            None => std::ops::Bound::Unbounded,
        };
        self.scan((start, end))
    }

    /// Sets a value for a key, replacing the existing value if any.
    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<()>;

    /// Returns engine status.
    fn status(&mut self) -> Result<Status>;
}

/// A scan iterator, with a blanket implementation (in lieu of trait aliases).
pub trait ScanIterator: DoubleEndedIterator<Item = Result<(Vec<u8>, Vec<u8>)>> {}

impl<I: DoubleEndedIterator<Item = Result<(Vec<u8>, Vec<u8>)>>> ScanIterator for I {}

/// Engine status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The name of the storage engine.
    pub name: String,
    /// The number of live keys in the engine.
    pub keys: u64,
    /// The logical size of live key/value pairs.
    pub size: u64,
    /// The on-disk size of all data, live and garbage.
    pub total_disk_size: u64,
    /// The on-disk size of live data.
    pub live_disk_size: u64,
    /// The on-disk size of garbage data.
    pub garbage_disk_size: u64,
}

impl Status {
    /// The fraction of on-disk data that is garbage.
    pub fn garbage_disk_percent(&self) -> f64 {
        if self.total_disk_size == 0 {
            return 0.0;
        }
        self.garbage_disk_size as f64 / self.total_disk_size as f64 * 100.0
    }
}

/// Test helpers for engines.
#[cfg(test)]
pub mod test {
    use super::*;
    use crossbeam::channel::Sender;

    /// Wraps another engine and emits write events to the given channel. Used
    /// to assert on e.g. flush ordering in the Raft log.
    pub struct Emit<E: Engine> {
        /// The wrapped engine.
        inner: E,
        /// Sends operation events.
        tx: Sender<Operation>,
    }

    /// An engine operation emitted by the Emit engine.
    #[derive(Clone, Debug, PartialEq)]
    pub enum Operation {
        Delete { key: Vec<u8> },
        Flush,
        Set { key: Vec<u8>, value: Vec<u8> },
    }

    impl<E: Engine> Emit<E> {
        pub fn new(inner: E, tx: Sender<Operation>) -> Self {
            Self { inner, tx }
        }
    }

    impl<E: Engine> Engine for Emit<E> {
        type ScanIterator<'a> = E::ScanIterator<'a> where E: 'a;

        fn flush(&mut self) -> Result<()> {
            self.inner.flush()?;
            self.tx.send(Operation::Flush)?;
            Ok(())
        }

        fn delete(&mut self, key: &[u8]) -> Result<()> {
            self.inner.delete(key)?;
            self.tx.send(Operation::Delete { key: key.to_vec() })?;
            Ok(())
        }

        fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_> {
            self.inner.scan(range)
        }

        fn scan_dyn(
            &mut self,
            range: (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>),
        ) -> Box<dyn ScanIterator + '_> {
            Box::new(self.scan(range))
        }

        fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
            self.inner.set(key, value.clone())?;
            self.tx.send(Operation::Set { key: key.to_vec(), value })?;
            Ok(())
        }

        fn status(&mut self) -> Result<Status> {
            self.inner.status()
        }
    }

    /// Generates common tests for any Engine implementation, given a setup
    /// expression returning a fresh engine.
    macro_rules! test_engine {
        ($setup:expr) => {
            #[test]
            /// Tests point operations on keys and values of increasing sizes.
            fn point_ops_sizes() -> $crate::error::Result<()> {
                let mut s = $setup;
                for size in (1..=16).map(|i| 1 << i) {
                    let bytes = "x".repeat(size);
                    let key = bytes.as_bytes();
                    let value = bytes.clone().into_bytes();

                    assert_eq!(s.get(key)?, None);
                    s.set(key, value.clone())?;
                    assert_eq!(s.get(key)?, Some(value));
                    s.delete(key)?;
                    assert_eq!(s.get(key)?, None);
                }
                Ok(())
            }

            #[test]
            /// Tests empty keys and values.
            fn point_ops_empty() -> $crate::error::Result<()> {
                let mut s = $setup;
                assert_eq!(s.get(b"")?, None);
                s.set(b"", vec![])?;
                assert_eq!(s.get(b"")?, Some(vec![]));
                s.delete(b"")?;
                assert_eq!(s.get(b"")?, None);
                Ok(())
            }

            #[test]
            /// Tests ordered scans, both forward and reverse, and prefix scans.
            fn scan() -> $crate::error::Result<()> {
                use std::ops::Bound;
                let mut s = $setup;
                s.set(b"a", vec![1])?;
                s.set(b"b", vec![2])?;
                s.set(b"ba", vec![3])?;
                s.set(b"bb", vec![4])?;
                s.set(b"c", vec![5])?;
                s.set(&[0xff, 0xff], vec![6])?;

                let scan: Vec<_> = s
                    .scan((Bound::Included(b"b".to_vec()), Bound::Excluded(b"c".to_vec())))
                    .collect::<$crate::error::Result<_>>()?;
                assert_eq!(
                    scan,
                    vec![
                        (b"b".to_vec(), vec![2]),
                        (b"ba".to_vec(), vec![3]),
                        (b"bb".to_vec(), vec![4]),
                    ]
                );

                let scan: Vec<_> =
                    s.scan(..).rev().take(2).collect::<$crate::error::Result<_>>()?;
                assert_eq!(scan, vec![(vec![0xff, 0xff], vec![6]), (b"c".to_vec(), vec![5])]);

                let scan: Vec<_> =
                    s.scan_prefix(b"b").collect::<$crate::error::Result<_>>()?;
                assert_eq!(scan.len(), 3);

                let scan: Vec<_> =
                    s.scan_prefix(&[0xff]).collect::<$crate::error::Result<_>>()?;
                assert_eq!(scan, vec![(vec![0xff, 0xff], vec![6])]);
                Ok(())
            }

            #[test]
            /// Runs random operations both on the engine and a known-good
            /// BTreeMap, comparing the results.
            fn random_ops() -> $crate::error::Result<()> {
                use rand::{Rng as _, RngCore as _, SeedableRng as _};
                let seed: u64 = rand::thread_rng().gen();
                let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
                println!("seed = {seed}");

                let mut s = $setup;
                let mut m = std::collections::BTreeMap::new();
                for _ in 0..1000 {
                    let mut key = vec![0; rng.gen_range(0..=3)];
                    rng.fill_bytes(&mut key);
                    match rng.gen_range(0..4) {
                        0 => {
                            let mut value = vec![0; rng.gen_range(0..=16)];
                            rng.fill_bytes(&mut value);
                            s.set(&key, value.clone())?;
                            m.insert(key, value);
                        }
                        1 => {
                            s.delete(&key)?;
                            m.remove(&key);
                        }
                        2 => assert_eq!(s.get(&key)?, m.get(&key).cloned()),
                        _ => {
                            let scan: Vec<_> = s
                                .scan(key.clone()..)
                                .collect::<$crate::error::Result<_>>()?;
                            let expect: Vec<_> =
                                m.range(key..).map(|(k, v)| (k.clone(), v.clone())).collect();
                            assert_eq!(scan, expect);
                        }
                    }
                }
                let scan: Vec<_> = s.scan(..).collect::<$crate::error::Result<_>>()?;
                let expect: Vec<_> = m.into_iter().collect();
                assert_eq!(scan, expect);
                assert_eq!(s.status()?.keys, scan.len() as u64);
                Ok(())
            }
        };
    }

    pub(crate) use test_engine;
}
