// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

use crate::error::Error;

/// Invertible filler-byte transform lowering per-byte entropy of ciphertext.
pub trait Entropy: Send + Sync {
    /// Insert filler bytes into `data`.
    fn decrease(&self, data: &[u8]) -> Vec<u8>;

    /// Strip the filler bytes inserted by [`Entropy::decrease`].
    fn increase(&self, data: &[u8]) -> Vec<u8>;
}

/// Filler codec inserting the most frequent input byte on a fixed stride.
///
/// One filler byte follows every full run of `rate - 1` payload bytes; a
/// shorter tail is carried unchanged. Both ends must agree on `rate` or the
/// receiver will mis-strip.
pub struct SimpleEntropy {
    /// Output stride, one filler byte per `rate` output bytes.
    rate: usize,
}

impl SimpleEntropy {
    /// Create new [`SimpleEntropy`] with the given `rate`.
    pub fn new(rate: usize) -> crate::Result<Self> {
        if rate < 2 {
            return Err(Error::Config(String::from("entropy rate must be at least 2")));
        }

        Ok(Self { rate })
    }

    /// The most frequent byte of `data`, ties resolving to the lowest value.
    fn noise(data: &[u8]) -> u8 {
        let mut counts = [0usize; 256];
        for byte in data {
            counts[*byte as usize] += 1;
        }

        let mut noise = 0u8;
        let mut best = 0usize;
        for (value, count) in counts.iter().enumerate() {
            if *count > best {
                best = *count;
                noise = value as u8;
            }
        }

        noise
    }
}

impl Entropy for SimpleEntropy {
    fn decrease(&self, data: &[u8]) -> Vec<u8> {
        let stride = self.rate - 1;
        let noise = Self::noise(data);

        let mut decreased = Vec::with_capacity(data.len() + data.len() / stride + 1);
        for chunk in data.chunks(stride) {
            decreased.extend_from_slice(chunk);
            if chunk.len() == stride {
                decreased.push(noise);
            }
        }

        decreased
    }

    fn increase(&self, data: &[u8]) -> Vec<u8> {
        let mut increased = Vec::with_capacity(data.len());
        for chunk in data.chunks(self.rate) {
            if chunk.len() == self.rate {
                increased.extend_from_slice(&chunk[..self.rate - 1]);
            } else {
                increased.extend_from_slice(chunk);
            }
        }

        increased
    }
}

/// Shannon entropy of `data` over byte symbols, in bits.
pub fn shannon(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0f64;
    }

    let mut counts = [0usize; 256];
    for byte in data {
        counts[*byte as usize] += 1;
    }

    counts
        .iter()
        .filter(|count| **count > 0)
        .map(|count| {
            let prob = *count as f64 / data.len() as f64;
            -prob * prob.log2()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for rate in [2usize, 3, 5, 16] {
            let entropy = SimpleEntropy::new(rate).unwrap();

            for len in 0usize..64 {
                let data = (0..len).map(|value| value as u8).collect::<Vec<_>>();
                let decreased = entropy.decrease(&data);

                assert_eq!(entropy.increase(&decreased), data, "rate {rate}, len {len}");
            }
        }
    }

    #[test]
    fn filler_is_inserted_on_stride() {
        let entropy = SimpleEntropy::new(5).unwrap();
        let decreased = entropy.decrease(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);

        // two full runs of four bytes followed by the one-byte tail
        assert_eq!(decreased.len(), 11);
        assert_eq!(&decreased[..4], &[1, 2, 3, 4]);
        assert_eq!(&decreased[5..9], &[5, 6, 7, 8]);
        assert_eq!(decreased[10], 9);
    }

    #[test]
    fn short_tail_carries_no_filler() {
        let entropy = SimpleEntropy::new(5).unwrap();

        assert_eq!(entropy.decrease(&[1, 2, 3]), vec![1, 2, 3]);
    }

    #[test]
    fn noise_ties_resolve_to_lowest_value() {
        assert_eq!(SimpleEntropy::noise(&[7, 3, 7, 3]), 3);
        assert_eq!(SimpleEntropy::noise(&[]), 0);
        assert_eq!(SimpleEntropy::noise(&[200, 100, 200]), 200);
    }

    #[test]
    fn rate_below_two_is_rejected() {
        assert!(SimpleEntropy::new(0).is_err());
        assert!(SimpleEntropy::new(1).is_err());
        assert!(SimpleEntropy::new(2).is_ok());
    }

    #[test]
    fn shannon_bounds() {
        assert_eq!(shannon(&[]), 0f64);
        assert_eq!(shannon(&[42; 100]), 0f64);

        let uniform = (0u16..256).map(|value| value as u8).collect::<Vec<_>>();
        assert!((shannon(&uniform) - 8f64).abs() < 1e-9);
    }

    #[test]
    fn decrease_lowers_measured_entropy() {
        let entropy = SimpleEntropy::new(3).unwrap();
        let uniform = (0u16..256).map(|value| value as u8).collect::<Vec<_>>();

        assert!(shannon(&entropy.decrease(&uniform)) < shannon(&uniform));
    }
}
