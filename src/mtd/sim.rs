// RAM-backed flash double for the test suite.
//
// Bad blocks, erase failures and uncorrectable-ECC reads are injectable so
// the recovery paths of the layers above can be exercised.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::{AccessMode, EccStats, FlashOpener, FlashPartition, Geometry, MtdError, RawMtd};

struct SimState {
    geom: Geometry,
    data: Vec<u8>,
    bad: Vec<bool>,
    erase_fail: HashSet<u32>,
    ecc_fail_pending: bool,
    stats: EccStats,
}

/// Test-side handle over the simulated device.
#[derive(Clone)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    pub fn create(peb_count: u32, erase_size: u32, write_size: u32) -> SimDevice {
        let size = u64::from(peb_count) * u64::from(erase_size);
        SimDevice {
            state: Arc::new(Mutex::new(SimState {
                geom: Geometry {
                    size,
                    erase_size,
                    write_size,
                    peb_count,
                },
                data: vec![super::ERASED_BYTE; size as usize],
                bad: vec![false; peb_count as usize],
                erase_fail: HashSet::new(),
                ecc_fail_pending: false,
                stats: EccStats::default(),
            })),
        }
    }

    /// A `RawMtd` view sharing this device's storage.
    pub fn raw(&self) -> SimMtd {
        SimMtd {
            state: self.state.clone(),
        }
    }

    /// A `FlashOpener` view sharing this device's storage.
    pub fn opener(&self) -> SimOpener {
        SimOpener {
            state: self.state.clone(),
        }
    }

    pub fn set_bad(&self, peb: u32) {
        self.state.lock().unwrap().bad[peb as usize] = true;
    }

    pub fn is_bad(&self, peb: u32) -> bool {
        self.state.lock().unwrap().bad[peb as usize]
    }

    /// Make the next erase of `peb` fail with a hardware error.
    pub fn fail_erase(&self, peb: u32) {
        self.state.lock().unwrap().erase_fail.insert(peb);
    }

    /// Make the next read report an uncorrectable ECC error.
    pub fn inject_ecc_failure(&self) {
        self.state.lock().unwrap().ecc_fail_pending = true;
    }

    /// Contents of one physical erase block.
    pub fn peb(&self, peb: u32) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let erase = state.geom.erase_size as usize;
        let start = peb as usize * erase;
        state.data[start..start + erase].to_vec()
    }

    pub fn read_range(&self, offset: u64, len: usize) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        state.data[offset as usize..offset as usize + len].to_vec()
    }

    /// Pre-load raw contents, e.g. an origin image for delta tests.
    pub fn fill(&self, offset: u64, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.data[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
    }
}

/// `RawMtd` implementation over the shared RAM array.
pub struct SimMtd {
    state: Arc<Mutex<SimState>>,
}

impl RawMtd for SimMtd {
    fn geometry(&self) -> Geometry {
        self.state.lock().unwrap().geom
    }

    fn is_bad(&mut self, peb: u32) -> Result<bool, MtdError> {
        let state = self.state.lock().unwrap();
        if peb >= state.geom.peb_count {
            return Err(MtdError::OutOfRange(peb));
        }
        Ok(state.bad[peb as usize])
    }

    fn mark_bad(&mut self, peb: u32) -> Result<(), MtdError> {
        let mut state = self.state.lock().unwrap();
        if peb >= state.geom.peb_count {
            return Err(MtdError::OutOfRange(peb));
        }
        state.bad[peb as usize] = true;
        state.stats.bad_blocks += 1;
        Ok(())
    }

    fn erase(&mut self, peb: u32) -> Result<(), MtdError> {
        let mut state = self.state.lock().unwrap();
        if peb >= state.geom.peb_count {
            return Err(MtdError::OutOfRange(peb));
        }
        if state.erase_fail.remove(&peb) {
            return Err(MtdError::Hardware(format!("simulated erase failure on PEB {}", peb)));
        }
        let erase = state.geom.erase_size as usize;
        let start = peb as usize * erase;
        state.data[start..start + erase].fill(super::ERASED_BYTE);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), MtdError> {
        let mut state = self.state.lock().unwrap();
        let end = offset as usize + buf.len();
        if end > state.data.len() {
            return Err(MtdError::OutOfRange((offset / u64::from(state.geom.erase_size)) as u32));
        }
        if state.ecc_fail_pending {
            state.ecc_fail_pending = false;
            state.stats.failed += 1;
        }
        buf.copy_from_slice(&state.data[offset as usize..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), MtdError> {
        let mut state = self.state.lock().unwrap();
        let end = offset as usize + buf.len();
        if end > state.data.len() {
            return Err(MtdError::OutOfRange((offset / u64::from(state.geom.erase_size)) as u32));
        }
        state.data[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn ecc_stats(&mut self) -> Result<EccStats, MtdError> {
        Ok(self.state.lock().unwrap().stats)
    }
}

/// `FlashOpener` handing out partitions over the shared RAM array.
pub struct SimOpener {
    state: Arc<Mutex<SimState>>,
}

impl FlashOpener for SimOpener {
    fn open(&self, mode: AccessMode) -> Result<FlashPartition, MtdError> {
        Ok(FlashPartition::new(
            Box::new(SimMtd {
                state: self.state.clone(),
            }),
            mode,
        ))
    }
}
