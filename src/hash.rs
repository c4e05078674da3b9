// The mixing constants of the MurmurHash3 32-bit body and finalizer.
//
// MurmurHash3 was written by Austin Appleby, and is placed in the public domain.
const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

// An arbitrary bunch of bits.
const SEED: u32 = 0x39c2_ab57;

/// Scrambles an address into a well distributed 32-bit hash.
///
/// Addresses handed out by an object store are usually small multiples of some
/// stride, so their low bits are a poor choice for picking a slot. The low bits of
/// the mixed hash select a shard, and the remaining bits select a slot within it.
///
/// # Examples
///
/// ```
/// use addrcache::mix;
///
/// assert_eq!(mix(8), mix(8));
/// assert_ne!(mix(8) & 31, mix(16) & 31);
/// ```
#[inline]
pub fn mix(key: i32) -> u32 {
    let mut k = (key as u32).wrapping_mul(C1);
    k = k.rotate_left(15);
    k = k.wrapping_mul(C2);

    let mut h = SEED ^ k;
    h = h.rotate_left(13);
    h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);

    // Avalanche.
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}
