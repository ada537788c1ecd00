//! Nonce issuance (Secondary side) and nonce expectations (verifier side).

use std::collections::{HashMap, HashSet, VecDeque};

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::UpdateError;
use crate::types::{EcuSerial, Nonce};

/// The nonce in use and the one pre-generated for the following round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoncePair {
    pub current: Nonce,
    pub next: Nonce,
}

/// Owned by a Secondary. `current` may only be replaced once a submission
/// that used it has completed.
#[derive(Debug)]
pub struct NonceManager {
    pair: NoncePair,
    consumed: bool,
}

impl NonceManager {
    /// Issues the first nonce pair for an ECU.
    pub fn issue() -> Self {
        let current = fresh_nonce(None);
        NonceManager {
            pair: NoncePair {
                current,
                next: fresh_nonce(Some(current)),
            },
            consumed: false,
        }
    }

    pub fn pair(&self) -> NoncePair {
        self.pair
    }

    pub fn current_nonce(&self) -> Nonce {
        self.pair.current
    }

    /// Records that the submission bound to `current` completed, either
    /// accepted or definitively rejected.
    pub fn mark_consumed(&mut self) {
        self.consumed = true;
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    /// Promotes `next` to `current` and generates a new `next`.
    pub fn rotate(&mut self) -> Result<NoncePair, UpdateError> {
        if !self.consumed {
            return Err(UpdateError::RotationOutOfOrder);
        }
        let current = self.pair.next;
        self.pair = NoncePair {
            current,
            next: fresh_nonce(Some(current)),
        };
        self.consumed = false;
        Ok(self.pair)
    }
}

fn fresh_nonce(excluding: Option<Nonce>) -> Nonce {
    loop {
        let candidate = Nonce(OsRng.next_u64());
        if Some(candidate) != excluding {
            return candidate;
        }
    }
}

/// Retired nonces remembered per ECU. Older ones fall out of the window.
pub const RETIRED_NONCES_PER_ECU: usize = 64;

/// Most recently retired nonces of one ECU, oldest first.
#[derive(Debug, Default)]
struct RetiredWindow {
    order: VecDeque<Nonce>,
    members: HashSet<Nonce>,
}

impl RetiredWindow {
    fn insert(&mut self, nonce: Nonce, capacity: usize) {
        if !self.members.insert(nonce) {
            return;
        }
        self.order.push_back(nonce);
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }

    fn contains(&self, nonce: Nonce) -> bool {
        self.members.contains(&nonce)
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Verifier-side record of which nonce each ECU is expected to present.
/// Nonces that were consumed or superseded are retired and are not expected
/// again while they remain in the ECU's retired window.
#[derive(Debug)]
pub struct NonceLedger {
    expected: HashMap<EcuSerial, Nonce>,
    retired: HashMap<EcuSerial, RetiredWindow>,
    retired_capacity: usize,
}

impl Default for NonceLedger {
    fn default() -> Self {
        Self::with_retired_capacity(RETIRED_NONCES_PER_ECU)
    }
}

impl NonceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retired_capacity(retired_capacity: usize) -> Self {
        NonceLedger {
            expected: HashMap::new(),
            retired: HashMap::new(),
            retired_capacity: retired_capacity.max(1),
        }
    }

    /// Number of retired nonces currently remembered for `serial`.
    pub fn retired_len(&self, serial: &EcuSerial) -> usize {
        self.retired.get(serial).map_or(0, RetiredWindow::len)
    }

    /// Sets `nonce` as the one `serial` must present next. Re-expecting the
    /// same nonce is a no-op; a different nonce retires the previous one.
    pub fn expect(&mut self, serial: &EcuSerial, nonce: Nonce) -> Result<(), UpdateError> {
        if self.is_retired(serial, nonce) {
            return Err(UpdateError::StaleNonce(format!(
                "nonce {nonce} from ECU {serial} was already used"
            )));
        }
        if let Some(previous) = self.expected.insert(serial.clone(), nonce) {
            if previous != nonce {
                self.retire(serial, previous);
            }
        }
        Ok(())
    }

    pub fn expected(&self, serial: &EcuSerial) -> Option<Nonce> {
        self.expected.get(serial).copied()
    }

    /// Equality with the expected nonce is the sole freshness test.
    pub fn accept(&self, serial: &EcuSerial, supplied: Nonce) -> bool {
        self.expected(serial) == Some(supplied)
    }

    /// Accepts and retires `supplied` in one step.
    pub fn consume(&mut self, serial: &EcuSerial, supplied: Nonce) -> Result<(), UpdateError> {
        if !self.accept(serial, supplied) {
            return Err(UpdateError::StaleNonce(match self.expected(serial) {
                Some(_) => format!("nonce {supplied} from ECU {serial} is not the expected nonce"),
                None => format!("no nonce is outstanding for ECU {serial}"),
            }));
        }
        self.expected.remove(serial);
        self.retire(serial, supplied);
        Ok(())
    }

    fn is_retired(&self, serial: &EcuSerial, nonce: Nonce) -> bool {
        self.retired
            .get(serial)
            .is_some_and(|window| window.contains(nonce))
    }

    fn retire(&mut self, serial: &EcuSerial, nonce: Nonce) {
        let capacity = self.retired_capacity;
        self.retired.entry(serial.clone()).or_default().insert(nonce, capacity);
    }
}
