//! Control words and the payload cipher.

use tspipe_ecmg::CW_BYTES;

/// A DVB control word.
pub type ControlWord = [u8; CW_BYTES];

/// Control word entropy handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntropyMode {
    /// Keep the full 64-bit control word.
    FullCw,
    /// Reduce entropy to 48 bits: bytes 3 and 7 become checksums of the
    /// preceding three bytes, as done by CSA-aware receivers.
    #[default]
    ReduceEntropy,
}

/// Fold bytes 3 and 7 into checksums of the preceding bytes.
pub fn reduce_entropy(cw: &mut ControlWord) {
    cw[3] = cw[0].wrapping_add(cw[1]).wrapping_add(cw[2]);
    cw[7] = cw[4].wrapping_add(cw[5]).wrapping_add(cw[6]);
}

/// Payload cipher keyed by the current control word.
///
/// The keystream is a position-dependent xor of the control word bytes.
/// Encryption and decryption are the same operation. A DVB-CSA
/// implementation slots in behind the same two methods without touching
/// the crypto-period machinery.
#[derive(Debug, Clone, Default)]
pub struct Scrambling {
    key: ControlWord,
}

impl Scrambling {
    /// Load a control word, applying the entropy mode.
    pub fn init(&mut self, cw: &ControlWord, mode: EntropyMode) {
        self.key = *cw;
        if mode == EntropyMode::ReduceEntropy {
            reduce_entropy(&mut self.key);
        }
    }

    /// Encrypt a payload in place.
    pub fn encrypt(&self, data: &mut [u8]) {
        for (i, b) in data.iter_mut().enumerate() {
            *b ^= self.key[i & 7].rotate_left((i >> 3) as u32 & 7);
        }
    }

    /// Decrypt a payload in place.
    pub fn decrypt(&self, data: &mut [u8]) {
        self.encrypt(data);
    }
}

/// Random control word source.
#[derive(Debug, Default)]
pub struct CwGenerator {
    mode: EntropyMode,
}

impl CwGenerator {
    /// Create a generator with the given entropy mode.
    pub fn new(mode: EntropyMode) -> Self {
        Self { mode }
    }

    /// Draw a fresh control word.
    pub fn generate(&mut self) -> ControlWord {
        let mut cw: ControlWord = rand::random();
        if self.mode == EntropyMode::ReduceEntropy {
            reduce_entropy(&mut cw);
        }
        cw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let mut key = Scrambling::default();
        key.init(&[1, 2, 3, 4, 5, 6, 7, 8], EntropyMode::FullCw);
        let clear: Vec<u8> = (0u8..=183).collect();
        let mut data = clear.clone();
        key.encrypt(&mut data);
        assert_ne!(data, clear);
        key.decrypt(&mut data);
        assert_eq!(data, clear);
    }

    #[test]
    fn test_entropy_reduction_checksums() {
        let mut cw = [0x10, 0x20, 0x30, 0xFF, 0x01, 0x02, 0x03, 0xFF];
        reduce_entropy(&mut cw);
        assert_eq!(cw[3], 0x60);
        assert_eq!(cw[7], 0x06);
        // The other bytes are untouched.
        assert_eq!(&cw[..3], &[0x10, 0x20, 0x30]);
    }

    #[test]
    fn test_generator_respects_mode() {
        let mut gen = CwGenerator::new(EntropyMode::ReduceEntropy);
        let cw = gen.generate();
        assert_eq!(cw[3], cw[0].wrapping_add(cw[1]).wrapping_add(cw[2]));
        assert_eq!(cw[7], cw[4].wrapping_add(cw[5]).wrapping_add(cw[6]));
    }
}
