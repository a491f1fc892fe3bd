// Copyright 2022 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! The observation merge operator.
//!
//! Writers never read-modify-write an aggregate. They issue a merge
//! with the new observation's aggregate as the operand, and the
//! storage engine folds operands into the stored value with the rule
//! in [`Aggregate::merge`]. Since that rule is commutative and
//! associative, concurrent writers need no locking of their own.

use log::error;
use rocksdb::MergeOperands;

use super::key::{FORWARD_TAG, INVERTED_TAG};
use crate::entry::Aggregate;

/// The name the merge operator is registered under. RocksDB refuses to
/// open a database with a merge operator of a different name.
pub const MERGE_OPERATOR_NAME: &str = "observation-mergeop";

/// The function type RocksDB calls for merges. Both entry points share
/// it, since RocksDB takes them as one generic parameter.
pub type MergeFn = fn(&[u8], Option<&[u8]>, &MergeOperands) -> Option<Vec<u8>>;

/// The full-merge entry point: folds pending operands into the
/// existing value.
pub fn full_merge(key: &[u8], existing: Option<&[u8]>, operands: &MergeOperands) -> Option<Vec<u8>> {
    merge_values(key, existing, operands.iter())
}

/// The partial-merge entry point: folds pending operands together
/// without an existing value.
pub fn partial_merge(key: &[u8], _existing: Option<&[u8]>, operands: &MergeOperands) -> Option<Vec<u8>> {
    merge_values(key, None, operands.iter())
}

/// Folds `operands` into `existing` according to the key's tag.
///
/// * Forward keys: the existing aggregate (or the identity) is merged
///   with each operand. Undecodable operands are logged and skipped. An
///   undecodable existing value fails the merge.
/// * Inverted keys: the result is always empty.
///
/// Any other key fails the merge, which RocksDB surfaces as an error
/// on the operation that triggered it.
pub fn merge_values<'a, I>(key: &[u8], existing: Option<&[u8]>, operands: I) -> Option<Vec<u8>>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    match key.first() {
        Some(&FORWARD_TAG) => {
            let mut acc = match existing {
                Some(value) => match Aggregate::decode(value) {
                    Some(aggregate) => aggregate,
                    None => {
                        error!(
                            "Undecodable stored value under key {}",
                            key.escape_ascii()
                        );
                        return None;
                    }
                },
                None => Aggregate::IDENTITY,
            };
            for (i, operand) in operands.into_iter().enumerate() {
                match Aggregate::decode(operand) {
                    Some(aggregate) => acc.merge(&aggregate),
                    None => error!(
                        "Skipping undecodable merge operand {} under key {}",
                        i,
                        key.escape_ascii()
                    ),
                }
            }
            Some(acc.encode().to_vec())
        }
        Some(&INVERTED_TAG) => Some(Vec::new()),
        _ => {
            error!("Merge called on unknown key {}", key.escape_ascii());
            None
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn agg(count: u32, first_seen: u32, last_seen: u32) -> Vec<u8> {
        Aggregate {
            count,
            first_seen,
            last_seen,
        }
        .encode()
        .to_vec()
    }

    #[test]
    fn forward_keys_fold_operands() {
        let operands = [agg(1, 100, 100), agg(1, 100, 200)];
        let merged = merge_values(b"o\x1fk", None, operands.iter().map(Vec::as_slice)).unwrap();
        assert_eq!(merged, agg(2, 100, 200));

        let existing = agg(5, 50, 60);
        let merged = merge_values(
            b"o\x1fk",
            Some(existing.as_slice()),
            operands.iter().map(Vec::as_slice),
        )
        .unwrap();
        assert_eq!(merged, agg(7, 50, 200));
    }

    #[test]
    fn partial_then_full_agrees_with_full() {
        let operands = [agg(2, 30, 40), agg(1, 10, 20), agg(4, 35, 90)];
        let existing = agg(1, 25, 25);

        let direct = merge_values(
            b"o\x1fk",
            Some(existing.as_slice()),
            operands.iter().map(Vec::as_slice),
        )
        .unwrap();

        let partial = merge_values(b"o\x1fk", None, operands[1..].iter().map(Vec::as_slice)).unwrap();
        let staged = merge_values(
            b"o\x1fk",
            Some(existing.as_slice()),
            [operands[0].as_slice(), partial.as_slice()],
        )
        .unwrap();

        assert_eq!(direct, staged);
        assert_eq!(direct, agg(8, 10, 90));
    }

    #[test]
    fn undecodable_operands_are_skipped() {
        let good = agg(1, 10, 10);
        let merged = merge_values(b"o\x1fk", None, [&b"bad"[..], good.as_slice()]).unwrap();
        assert_eq!(merged, good);
    }

    #[test]
    fn undecodable_existing_value_fails() {
        let good = agg(1, 10, 10);
        assert_eq!(merge_values(b"o\x1fk", Some(&b"bad"[..]), [good.as_slice()]), None);
    }

    #[test]
    fn inverted_keys_merge_to_empty() {
        let good = agg(1, 10, 10);
        assert_eq!(
            merge_values(b"i\x1fk", Some(&b"junk"[..]), [good.as_slice()]),
            Some(Vec::new())
        );
    }

    #[test]
    fn unknown_keys_fail() {
        assert_eq!(merge_values(b"x\x1fk", None, [&b""[..]]), None);
        assert_eq!(merge_values(b"", None, [&b""[..]]), None);
    }
}
