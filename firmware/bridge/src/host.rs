//! SPI slave byte exchange, the command dispatcher backend, and the standby
//! responder used while no host is talking to us.

use core::sync::atomic::Ordering;

use defmt::*;
use embassy_stm32::gpio::Input;
use embassy_stm32::mode::Async;
use embassy_stm32::spi::SpiSlave;
use embassy_time::Instant;
use pij1850_protocol::{
    Backend, BusId, DispatchEvent, Exchange, LINK_TIMEOUT_MS, POWER_ACC, POWER_HOST,
    satellite_reply,
};
use pij1850_vpw::{Frame, Overflow};

use crate::{BUSES, FILTER, HOST_RX, INBOUND, LINK, OUTBOUND, SWITCH_CODE};

pub fn now_ms() -> u32 {
    Instant::now().as_millis() as u32
}

pub fn link_active() -> bool {
    LINK.is_active(now_ms(), LINK_TIMEOUT_MS)
}

#[embassy_executor::task]
pub async fn spi_task(mut spi: SpiSlave<'static, Async>) {
    info!("spi slave task starting");
    let mut exchange = Exchange::new();
    let mut load: u8 = 0;
    loop {
        let mut buf = [load];
        if let Err(e) = spi.transfer_in_place(&mut buf).await {
            warn!("spi transfer error: {:?}", e);
            continue;
        }
        LINK.note(now_ms());
        let reply = INBOUND.lock(|inbound| {
            OUTBOUND.lock(|outbound| {
                exchange.on_byte(
                    buf[0],
                    &mut *inbound.borrow_mut(),
                    &mut *outbound.borrow_mut(),
                )
            })
        });
        load = reply.load;
        if reply.received.is_some() {
            HOST_RX.signal(());
        }
    }
}

/// Board side of the dispatcher: channel queues, filter, power inputs.
pub struct Board {
    pub acc: Input<'static>,
    pub host_power: Input<'static>,
}

impl Backend for Board {
    fn switch_state(&mut self) -> u8 {
        SWITCH_CODE.load(Ordering::Relaxed)
    }

    fn power_state(&mut self) -> u8 {
        let mut bits = 0;
        if self.acc.is_high() {
            bits |= POWER_ACC;
        }
        if self.host_power.is_high() {
            bits |= POWER_HOST;
        }
        bits
    }

    fn pop_rx(&mut self, bus: BusId, room: usize) -> Result<Option<Frame>, Overflow> {
        BUSES[bus.index()].lock(|c| c.borrow_mut().rx_mut().pop_within(room))
    }

    fn clear_headers(&mut self) {
        FILTER.lock(|f| {
            let mut next = f.get();
            next.clear();
            f.set(next);
        });
    }

    fn add_header(&mut self, header: u8) -> bool {
        FILTER.lock(|f| {
            let mut next = f.get();
            let added = next.push(header);
            f.set(next);
            added
        })
    }

    fn enqueue_tx(&mut self, bus: BusId, frame: Frame) -> Result<(), Overflow> {
        BUSES[bus.index()].lock(|c| c.borrow_mut().tx_mut().push(frame))
    }

    fn outbound_free(&mut self) -> usize {
        OUTBOUND.lock(|o| o.borrow().free())
    }

    fn respond(&mut self, bytes: &[u8]) -> Result<(), Overflow> {
        OUTBOUND.lock(|o| o.borrow_mut().push_all(bytes))
    }
}

pub fn log_dispatch(ev: DispatchEvent) {
    match ev {
        DispatchEvent::ResponseDropped { .. }
        | DispatchEvent::HeaderListFull(_)
        | DispatchEvent::TxQueueFull { .. }
        | DispatchEvent::BadLength { .. } => warn!("dispatch: {}", ev),
        DispatchEvent::Unknown(b) => debug!("dispatch: ignoring byte 0x{:02x}", b),
        _ => trace!("dispatch: {}", ev),
    }
}

/// Answer satellite presence queries on bus 0 ourselves. Only called while
/// the host link is idle; other frames on bus 0 are dropped.
pub fn standby_respond() {
    while let Some(frame) = BUSES[0].lock(|c| c.borrow_mut().rx_mut().pop()) {
        let Some(reply) = satellite_reply(&frame) else {
            continue;
        };
        let queued = BUSES[0].lock(|c| c.borrow_mut().tx_mut().push(reply));
        match queued {
            Ok(()) => debug!("standby: answered {}", frame),
            Err(Overflow) => warn!("standby: tx queue full, reply dropped"),
        }
    }
}
