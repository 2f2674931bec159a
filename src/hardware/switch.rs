//! Binary actuator seam between the control core and the real pins.
//!
//! The PWM tick runs at interrupt rate, so the switch contract is
//! infallible and takes `&self`; a hardware implementation that can fail
//! has to log and swallow the error itself.

use core::cell::RefCell;
use core::fmt::Debug;
use core::sync::atomic::{AtomicBool, Ordering};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use log::{error, trace};

pub trait OutputSwitch: Send + Sync {
    fn set_active(&self, on: bool);
}

/// Pure-software switch. Backs the simulated machine and the unit tests;
/// the PWM drivers cannot tell it apart from a real SSR pin.
pub struct SoftSwitch {
    name: &'static str,
    on: AtomicBool,
}

impl SoftSwitch {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            on: AtomicBool::new(false),
        }
    }

    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::Acquire)
    }
}

impl OutputSwitch for SoftSwitch {
    fn set_active(&self, on: bool) {
        if self.on.swap(on, Ordering::AcqRel) != on {
            trace!("switch {}: {}", self.name, if on { "ON" } else { "OFF" });
        }
    }
}

/// Adapter for a real `embedded-hal` output pin. Pin errors are logged and
/// dropped; the tick path must never propagate a failure.
pub struct HalSwitch<P> {
    name: &'static str,
    pin: Mutex<CriticalSectionRawMutex, RefCell<P>>,
}

impl<P> HalSwitch<P> {
    pub fn new(name: &'static str, pin: P) -> Self {
        Self {
            name,
            pin: Mutex::new(RefCell::new(pin)),
        }
    }
}

impl<P> OutputSwitch for HalSwitch<P>
where
    P: embedded_hal::digital::v2::OutputPin + Send,
    P::Error: Debug,
{
    fn set_active(&self, on: bool) {
        self.pin.lock(|pin| {
            let mut pin = pin.borrow_mut();
            let result = if on { pin.set_high() } else { pin.set_low() };
            if let Err(e) = result {
                error!("switch {}: pin write failed: {:?}", self.name, e);
            }
        });
    }
}
