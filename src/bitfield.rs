//! Piece availability bitfields and the predicates defined over them.

use bitvec::prelude::{BitVec, Msb0};

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least significant
/// bits, that is, where the first highest bit represents the first piece, the
/// second highest element the second piece, and so on (e.g. `0b1100_0001`
/// would mean that we have pieces 0, 1, and 7). A truthy boolean value of a
/// piece's position in this vector means that the peer has the piece, while a
/// falsy value means it doesn't have the piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// Returns a bitfield for a peer holding no pieces.
pub fn empty(num_pieces: usize) -> Bitfield {
    BitVec::repeat(false, num_pieces)
}

/// Returns a bitfield for a peer holding every piece.
pub fn full(num_pieces: usize) -> Bitfield {
    BitVec::repeat(true, num_pieces)
}

/// Packs the bitfield into the wire representation: big endian bytes where
/// bit 7 of byte 0 is piece 0. Trailing bits of the last byte are zero.
pub fn to_bytes(bitfield: &Bitfield) -> Vec<u8> {
    let mut bytes = vec![0; (bitfield.len() + 7) / 8];
    for index in bitfield.iter_ones() {
        bytes[index / 8] |= 0x80 >> (index % 8);
    }
    bytes
}

/// Unpacks a wire bitfield into `num_pieces` bits.
///
/// The wire form is padded to whole bytes, so the input is truncated back to
/// the piece count; a short input is zero filled.
pub fn from_bytes(bytes: &[u8], num_pieces: usize) -> Bitfield {
    let mut bitfield = Bitfield::from_slice(bytes);
    bitfield.resize(num_pieces, false);
    bitfield
}

/// Whether `remote` holds any piece that `local` lacks, i.e. whether the
/// local peer should be interested in the remote one.
pub fn has_interesting(local: &Bitfield, remote: &Bitfield) -> bool {
    remote.iter_ones().any(|index| !local[index])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn bitfield_with(num_pieces: usize, owned: &[usize]) -> Bitfield {
        let mut bitfield = empty(num_pieces);
        for &index in owned {
            bitfield.set(index, true);
        }
        bitfield
    }

    #[test]
    fn packs_msb_first() {
        // 11 pieces of which 0, 3, and 10 are owned: 1001_0000 0010_0000
        let bitfield = bitfield_with(11, &[0, 3, 10]);
        assert_eq!(to_bytes(&bitfield), vec![0x90, 0x20]);
    }

    #[test]
    fn unpacks_msb_first() {
        let bitfield = from_bytes(&[0x90, 0x20], 11);
        assert_eq!(bitfield, bitfield_with(11, &[0, 3, 10]));
    }

    #[test]
    fn round_trips_through_wire_form() {
        for num_pieces in [1, 7, 8, 9, 11, 64, 306] {
            let mut bitfield = empty(num_pieces);
            for index in (0..num_pieces).step_by(3) {
                bitfield.set(index, true);
            }
            assert_eq!(from_bytes(&to_bytes(&bitfield), num_pieces), bitfield);
        }
    }

    #[test]
    fn truncates_padding_and_zero_fills_short_input() {
        // a full byte of padding beyond the 3 real pieces
        let bitfield = from_bytes(&[0xff, 0xff], 3);
        assert_eq!(bitfield.len(), 3);
        assert!(bitfield.all());

        // no bytes at all still yields an empty bitfield of the right length
        let bitfield = from_bytes(&[], 5);
        assert_eq!(bitfield.len(), 5);
        assert!(bitfield.not_any());
    }

    #[test]
    fn interest_is_having_something_we_lack() {
        let local = bitfield_with(4, &[0, 1]);
        assert!(has_interesting(&local, &bitfield_with(4, &[2])));
        assert!(!has_interesting(&local, &bitfield_with(4, &[0, 1])));
        assert!(!has_interesting(&local, &bitfield_with(4, &[])));
        assert!(!has_interesting(&full(4), &full(4)));
    }

    #[test]
    fn completion_is_all_bits_set() {
        let mut bitfield = bitfield_with(3, &[0, 2]);
        assert!(!bitfield.all());
        bitfield.set(1, true);
        assert!(bitfield.all());
    }
}
