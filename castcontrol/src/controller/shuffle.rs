//! Unbiased Fisher-Yates shuffle over OS entropy.

use rand::rngs::OsRng;
use rand::RngCore;

/// Shuffle in place.
pub fn shuffle<T>(items: &mut [T]) {
    let mut rng = OsRng;
    for i in (1..items.len()).rev() {
        let j = random_below(&mut rng, i + 1);
        items.swap(i, j);
    }
}

/// A uniform index in [0, n) by rejection sampling: values in the ragged
/// tail of the generator range are discarded instead of folded in, which
/// is what keeps the modulo unbiased.
fn random_below<R: RngCore>(rng: &mut R, n: usize) -> usize {
    debug_assert!(n > 0);
    if n == 1 {
        return 0;
    }
    if n <= 256 {
        let n = n as u16;
        // 256 when n divides the byte range exactly: every byte accepted.
        let limit = 256u16 - 256u16 % n;
        loop {
            let mut byte = [0u8; 1];
            rng.fill_bytes(&mut byte);
            let value = byte[0] as u16;
            if value < limit {
                return (value % n) as usize;
            }
        }
    }
    let n = n as u64;
    let limit = u64::MAX - u64::MAX % n;
    loop {
        let value = rng.next_u64();
        if value < limit {
            return (value % n) as usize;
        }
    }
}
