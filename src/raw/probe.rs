// The load factor at which a shard table doubles.
const LOAD_FACTOR: f32 = 0.60;

// Returns the number of live entries that triggers growing a table of length `len`.
pub fn threshold(len: usize) -> usize {
    (len as f32 * LOAD_FACTOR) as usize
}

// An increasing-step probe sequence.
//
// The first probe lands on `hash & mask`, and every collision advances by a step
// one larger than the last. Over a power-of-two table this walks the triangular
// numbers, which visits every slot and breaks up the clusters that strided keys
// form under linear probing.
//
// A probe is resumable: it always points at the slot where the last search
// stopped, so a search that started without the shard lock can continue under it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Probe {
    // The current slot index.
    pub i: usize,
    // The step to the next slot.
    delta: usize,
}

impl Probe {
    // Start a probe sequence for the given hash.
    #[inline]
    pub fn start(hash: u32, mask: usize) -> Probe {
        Probe {
            i: hash as usize & mask,
            delta: 1,
        }
    }

    // Advance to the next slot.
    #[inline]
    pub fn next(&mut self, mask: usize) {
        self.i = (self.i + self.delta) & mask;
        self.delta += 1;
    }
}
