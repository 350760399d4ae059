use sha2::{Digest, Sha256};

use crate::error::Error;

// MAX_HEIGHT determines the maximum allowable index and the length of the
// bucket array required to derive all previous secrets by index.
pub const MAX_HEIGHT: u8 = 48;

/// The index corresponding to the root secret (the seed). Every other index
/// is derivable from it.
pub const ROOT_INDEX: Index = Index(0);

/// The index of the first secret produced by the chain; consumption proceeds
/// downward from here towards zero.
pub const START_INDEX: Index = Index((1 << MAX_HEIGHT) - 1);

/// A 48-bit position in the shachain domain. Identifies a secret and, by
/// comparing two indexes, the hashing operations required to derive one
/// secret from another.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Index(pub u64);

impl Index {
    /// Maps the n-th commitment (counting up from zero) onto the descending
    /// index domain.
    pub fn from_commitment_number(n: u64) -> Self {
        Index(START_INDEX.0 - n)
    }

    /// The commitment number this index belongs to.
    pub fn commitment_number(&self) -> u64 {
        START_INDEX.0 - self.0
    }

    /// Number of trailing zero bits, capped at `MAX_HEIGHT`. Equals the
    /// height of the sub-tree whose secrets this index can regenerate.
    pub fn height(&self) -> u8 {
        for n in 0..MAX_HEIGHT {
            if (self.0 >> n) & 1 == 1 {
                return n;
            }
        }
        MAX_HEIGHT
    }

    // The bit positions which must be flipped (highest first) to walk from
    // `self` down to `to`. `to` is derivable iff both indexes agree above
    // our trailing-zero region.
    fn bit_transformations(&self, to: Index) -> Result<Vec<u8>, Error> {
        if self.0 == to.0 {
            return Ok(Vec::new());
        }

        let zeros = self.height();
        if self.0 != prefix(to, zeros) {
            return Err(Error::CannotDerive { from: *self, to });
        }

        let mut positions = Vec::new();
        for position in (0..zeros).rev() {
            if (to.0 >> position) & 1 == 1 {
                positions.push(position);
            }
        }
        Ok(positions)
    }
}

// Clears the lowest `n` bits, keeping the shared prefix.
fn prefix(index: Index, n: u8) -> u64 {
    if n >= 64 {
        0
    } else {
        index.0 & !((1u64 << n) - 1)
    }
}

/// A secret together with its position in the chain. The output of the
/// shachain PRF; deriving from one element to another applies a series of
/// bit flips and hash operations determined by the two indexes.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Element {
    pub index: Index,
    pub hash: [u8; 32],
}

impl Element {
    /// Computes the element at `to_index` from this one. Fails when
    /// `to_index` lies outside the sub-tree this element spans.
    pub fn derive(&self, to_index: Index) -> Result<Element, Error> {
        let positions = self.index.bit_transformations(to_index)?;

        let mut hash = self.hash;
        for position in positions {
            let byte_number = usize::from(position / 8);
            let bit_number = position % 8;
            hash[byte_number] ^= 1 << bit_number;

            let digest = Sha256::digest(hash);
            hash.copy_from_slice(&digest);
        }

        Ok(Element {
            index: to_index,
            hash,
        })
    }

    /// Whether `to_index` lies within the sub-tree spanned by this element.
    pub fn can_derive(&self, to_index: Index) -> bool {
        self.index.0 == prefix(to_index, self.index.height())
    }
}
