//! One task per VPW channel: edges from the sense pin and compare matches
//! from the embassy timer are fed into the channel state machine. Both tasks
//! run on the interrupt executor, above the foreground loop.

use core::sync::atomic::{AtomicU32, Ordering};

use defmt::*;
use embassy_futures::select::{Either3, select3};
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::gpio::Output;
use embassy_time::{Instant, Timer};
use pij1850_protocol::BusId;
use pij1850_vpw::{BusPins, ChannelConfig, ChannelEvent, Level, VpwTiming};

use crate::{BUSES, FILTER, KICK};

const TIMING: VpwTiming = ChannelConfig::DEFAULT.timing;
// Faults are counted; only every Nth one is logged.
const FAULT_LOG_EVERY: u32 = 64;

static FAULTS: [AtomicU32; 2] = [AtomicU32::new(0), AtomicU32::new(0)];

/// Sense input (high = bus active) plus drive output (high = pull the bus active).
pub struct BusIo {
    pub sense: ExtiInput<'static>,
    pub drive: Output<'static>,
}

impl BusPins for BusIo {
    fn sensed(&self) -> Level {
        Level::from_active(self.sense.is_high())
    }

    fn drive(&mut self, level: Level) {
        if level.is_active() {
            self.drive.set_high();
        } else {
            self.drive.set_low();
        }
    }
}

fn tick_at(at: Instant) -> u8 {
    TIMING.tick_at_us(at.as_micros())
}

fn deadline(now: Instant, compare: Option<u8>) -> Option<Instant> {
    let c = compare?;
    Some(Instant::from_micros(TIMING.compare_at_us(now.as_micros(), c)))
}

fn log_event(bus: BusId, ev: ChannelEvent) {
    match ev {
        ChannelEvent::Received { .. }
        | ChannelEvent::Filtered { .. }
        | ChannelEvent::TxStarted { .. }
        | ChannelEvent::TxDone { .. } => trace!("{}: {}", bus, ev),
        ChannelEvent::RxFault(_) | ChannelEvent::CrcMismatch => {
            let n = FAULTS[bus.index()].fetch_add(1, Ordering::Relaxed) + 1;
            if n % FAULT_LOG_EVERY == 1 {
                warn!("{}: {} ({} faults so far)", bus, ev, n);
            }
        }
        ChannelEvent::RxQueueFull | ChannelEvent::Contention => warn!("{}: {}", bus, ev),
    }
}

#[embassy_executor::task(pool_size = 2)]
pub async fn bus_task(bus: BusId, mut io: BusIo) {
    let idx = bus.index();
    info!("{}: bus task starting", bus);

    BUSES[idx].lock(|c| io.drive(c.borrow().driven()));
    let mut level = io.sensed();
    let mut next: Option<Instant> = None;

    loop {
        let timer = Timer::at(next.unwrap_or(Instant::MAX));
        let woke = select3(io.sense.wait_for_any_edge(), timer, KICK[idx].wait()).await;
        match woke {
            Either3::First(()) => {
                let now = Instant::now();
                let sensed = io.sensed();
                if sensed == level {
                    continue;
                }
                level = sensed;
                let (ev, compare) = BUSES[idx].lock(|c| {
                    let mut ch = c.borrow_mut();
                    let ev = ch.on_edge(&mut io, tick_at(now), sensed);
                    (ev, ch.compare())
                });
                if let Some(ev) = ev {
                    log_event(bus, ev);
                }
                next = deadline(now, compare);
            }
            Either3::Second(()) => {
                let now = Instant::now();
                let filter = FILTER.lock(|f| f.get());
                let (ev, compare) = BUSES[idx].lock(|c| {
                    let mut ch = c.borrow_mut();
                    let ev = ch.on_match(&mut io, tick_at(now), &filter);
                    (ev, ch.compare())
                });
                if let Some(ev) = ev {
                    log_event(bus, ev);
                }
                // Our own drive change shows up as an edge on the next pass.
                next = deadline(now, compare);
            }
            Either3::Third(()) => {
                let now = Instant::now();
                let compare = BUSES[idx].lock(|c| {
                    let mut ch = c.borrow_mut();
                    if ch.request_send(tick_at(now)) {
                        trace!("{}: send armed", bus);
                    }
                    ch.compare()
                });
                next = deadline(now, compare);
            }
        }
    }
}
