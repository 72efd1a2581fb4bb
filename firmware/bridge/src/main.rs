#![no_std]
#![no_main]

use defmt::*;
use defmt_rtt as _;
use panic_probe as _;

use core::cell::{Cell, RefCell};
use core::sync::atomic::AtomicU8;
use embassy_executor::{InterruptExecutor, Spawner};
use embassy_futures::select::select;
use embassy_stm32 as stm32;
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::gpio::{Input, Level as PinLevel, Output, Pull, Speed};
use embassy_stm32::interrupt;
use embassy_stm32::interrupt::{InterruptExt, Priority};
use embassy_stm32::spi::{self, SpiSlave};
use embassy_sync::blocking_mutex::{Mutex, raw::CriticalSectionRawMutex};
use embassy_sync::signal::Signal;
use embassy_time::Timer;
use pij1850_protocol::{BusId, ByteRing, Dispatcher, LinkActivity, RING_LEN};
use pij1850_vpw::{ChannelConfig, HeaderFilter, OverflowPolicy, VpwChannel};

mod bus;
mod host;

use bus::{BusIo, bus_task};
use host::{Board, link_active, log_dispatch, spi_task, standby_respond};

/// Frames buffered per channel per direction.
const QUEUE_DEPTH: usize = 16;
/// Header the bridge listens for until the host sets its own list.
const DEFAULT_HEADER: u8 = 0x8D;
/// Foreground wakes at least this often to start queued transmissions.
const HOUSEKEEPING_MS: u64 = 1;

type CsMutex<T> = Mutex<CriticalSectionRawMutex, T>;
type Channel = VpwChannel<QUEUE_DEPTH>;

static BUSES: [CsMutex<RefCell<Channel>>; 2] = [
    Mutex::new(RefCell::new(VpwChannel::new(ChannelConfig::DEFAULT))),
    Mutex::new(RefCell::new(VpwChannel::new(ChannelConfig::DEFAULT))),
];
static FILTER: CsMutex<Cell<HeaderFilter>> = Mutex::new(Cell::new(HeaderFilter::accept_all()));
static INBOUND: CsMutex<RefCell<ByteRing<RING_LEN>>> =
    Mutex::new(RefCell::new(ByteRing::new(OverflowPolicy::DropOldest)));
static OUTBOUND: CsMutex<RefCell<ByteRing<RING_LEN>>> =
    Mutex::new(RefCell::new(ByteRing::new(OverflowPolicy::DropNewest)));
static LINK: LinkActivity = LinkActivity::new();
/// Wakes a bus task when its TX queue has a frame waiting.
static KICK: [Signal<CriticalSectionRawMutex, ()>; 2] = [Signal::new(), Signal::new()];
/// Set by the SPI task whenever a payload byte lands in the inbound ring.
static HOST_RX: Signal<CriticalSectionRawMutex, ()> = Signal::new();
/// Rotary switch code as published by the switch sampler; 0 until it reports.
static SWITCH_CODE: AtomicU8 = AtomicU8::new(0);

/// Runs both bus tasks so edges and compare matches preempt the foreground.
static BUS_EXECUTOR: InterruptExecutor = InterruptExecutor::new();

#[interrupt]
unsafe fn UART4() {
    unsafe { BUS_EXECUTOR.on_interrupt() }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) -> ! {
    let mut config = stm32::Config::default();
    {
        use embassy_stm32::rcc::*;

        config.rcc.pll = Some(Pll {
            source: PllSource::HSI,
            prediv: PllPreDiv::DIV4,
            mul: PllMul::MUL85,
            divp: None,
            divq: None,
            divr: Some(PllRDiv::DIV2),
        });
        config.rcc.sys = Sysclk::PLL1_R;
    }
    let p = stm32::init(config);

    info!("{}", env!("PIJ1850_FW_VERSION"));

    FILTER.lock(|f| f.set(HeaderFilter::from_headers(&[DEFAULT_HEADER])));

    // Bus 0: sense PB0, drive PB1. Bus 1: sense PB4, drive PB5.
    let bus0 = BusIo {
        sense: ExtiInput::new(p.PB0, p.EXTI0, Pull::None),
        drive: Output::new(p.PB1, PinLevel::Low, Speed::VeryHigh),
    };
    let bus1 = BusIo {
        sense: ExtiInput::new(p.PB4, p.EXTI4, Pull::None),
        drive: Output::new(p.PB5, PinLevel::Low, Speed::VeryHigh),
    };
    // UART4 is unused on this board; its vector drives the bus executor.
    interrupt::UART4.set_priority(Priority::P6);
    let bus_spawner = BUS_EXECUTOR.start(interrupt::UART4);
    if let Err(e) = bus_spawner.spawn(bus_task(BusId::Bus0, bus0)) {
        warn!("failed to spawn bus_task(0): {:?}", e);
    }
    if let Err(e) = bus_spawner.spawn(bus_task(BusId::Bus1, bus1)) {
        warn!("failed to spawn bus_task(1): {:?}", e);
    }

    // SPI1 slave, mode 0: SCK PA5, MISO PA6, MOSI PA7, NSS PA4.
    let mut spi_cfg = spi::Config::default();
    spi_cfg.mode = spi::MODE_0;
    let spi = SpiSlave::new(
        p.SPI1, p.PA5, p.PA7, p.PA6, p.PA4, p.DMA1_CH1, p.DMA1_CH2, spi_cfg,
    );
    if let Err(e) = spawner.spawn(spi_task(spi)) {
        warn!("failed to spawn spi_task: {:?}", e);
    }

    // Accessory sense PA0, host power-good PA1.
    let mut board = Board {
        acc: Input::new(p.PA0, Pull::Down),
        host_power: Input::new(p.PA1, Pull::Down),
    };
    let mut dispatcher = Dispatcher::new();
    let mut link_was_active = false;

    info!(
        "bridge up: queue depth {}, ring {}, listening for 0x{:02x}",
        QUEUE_DEPTH, RING_LEN, DEFAULT_HEADER
    );

    loop {
        let _ = select(HOST_RX.wait(), Timer::after_millis(HOUSEKEEPING_MS)).await;

        while let Some(byte) = INBOUND.lock(|r| r.borrow_mut().pop()) {
            if let Some(ev) = dispatcher.feed(byte, &mut board) {
                log_dispatch(ev);
            }
        }

        let active = link_active();
        if active != link_was_active {
            info!("host link {}", if active { "up" } else { "down" });
            link_was_active = active;
        }
        if !active {
            standby_respond();
        }

        // The bus task arms the send itself so the compare is taken from its
        // own clock reading.
        for bus in BusId::ALL {
            if BUSES[bus.index()].lock(|c| c.borrow().wants_send()) {
                KICK[bus.index()].signal(());
            }
        }
    }
}
