use std::sync::{Arc, Mutex};

use super::PlcError;
use super::rtu::HoldingBlock;

/// One 16-bit holding register with a cached word.
///
/// Mutations update the cache and write through to the holding block before
/// returning, so the word the bus master sees never lags a mutator. Each cell
/// is internally locked; cross-cell ordering is the driver's job.
pub struct RegisterCell {
    block: Arc<HoldingBlock>,
    address: u16,
    word: Mutex<u16>,
}

impl RegisterCell {
    pub fn new(block: Arc<HoldingBlock>, address: u16) -> RegisterCell {
        RegisterCell {
            block,
            address,
            word: Mutex::new(0),
        }
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn set_bit(&self, bit: u8, level: bool) -> Result<(), PlcError> {
        let mut word = self.word.lock().unwrap();
        if level {
            *word |= 1 << bit;
        } else {
            *word &= !(1 << bit);
        }
        self.block.write(self.address, *word)
    }

    pub fn get_bit(&self, bit: u8) -> bool {
        (*self.word.lock().unwrap() >> bit) & 1 == 1
    }

    pub fn set_value(&self, value: u16) -> Result<(), PlcError> {
        let mut word = self.word.lock().unwrap();
        *word = value;
        self.block.write(self.address, value)
    }

    pub fn get_value(&self) -> u16 {
        *self.word.lock().unwrap()
    }

    pub fn reset_all_bits(&self) -> Result<(), PlcError> {
        self.set_value(0)
    }

    /// Refresh the cached word from the holding block.
    pub fn sync_from_device(&self) -> Result<(), PlcError> {
        let value = self.block.read(self.address)?;
        *self.word.lock().unwrap() = value;
        Ok(())
    }
}
