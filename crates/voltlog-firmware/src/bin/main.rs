#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use core::net::Ipv4Addr;

use embassy_executor::Spawner;
use embassy_net::{Config as NetConfig, Ipv4Cidr, Runner, StackResources, StaticConfigV4};
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Timer};
use embedded_storage::ReadStorage;
use esp_hal::clock::CpuClock;
use esp_hal::interrupt::software::SoftwareInterruptControl;
use esp_hal::rng::Rng;
use esp_hal::timer::timg::TimerGroup;
use esp_radio::wifi::WifiDevice;
use esp_storage::FlashStorage;
use log::{error, info, warn};
use static_cell::StaticCell;

use voltlog_core::clock::Monotonic;
use voltlog_core::config::{AccessPointConfig, CloudConfig, Config};
use voltlog_core::credentials::BootMode;
use voltlog_core::device::DeviceContext;
use voltlog_core::storage::{PersistentStore, REGION_SIZE};
use voltlog_firmware::clock::EmbassyClock;
use voltlog_firmware::cloud_link::{ClientState, HttpsLink};
use voltlog_firmware::dhcp::dhcp_server_task;
use voltlog_firmware::portal_server::portal_server_task;
use voltlog_firmware::sensor::AdcVoltageSensor;
use voltlog_firmware::wifi::Radio;
use voltlog_firmware::{SharedDevice, SharedRadio};

/// Addresses leased to portal clients, starting right after the AP address.
const DHCP_POOL_SIZE: u8 = 8;
/// Floor for the main cycle sleep.
const MIN_WAKE_MS: u64 = 100;

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

static RADIO_INIT: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();
static STA_RESOURCES: StaticCell<StackResources<4>> = StaticCell::new();
static AP_RESOURCES: StaticCell<StackResources<4>> = StaticCell::new();
static TCP_STATE: StaticCell<ClientState> = StaticCell::new();
static DEVICE: StaticCell<SharedDevice> = StaticCell::new();
static RADIO: StaticCell<SharedRadio> = StaticCell::new();

#[embassy_executor::task(pool_size = 2)]
async fn net_task(mut runner: Runner<'static, WifiDevice<'static>>) {
    runner.run().await
}

/// Cloud settings are baked in at build time from `.env`.
fn firmware_config() -> Config {
    Config {
        cloud: CloudConfig::new(
            option_env!("FIREBASE_API_KEY").unwrap_or_default(),
            option_env!("FIREBASE_DATABASE_URL").unwrap_or_default(),
            option_env!("FIREBASE_PATH").unwrap_or("/voltage"),
        ),
        ..Config::default()
    }
}

fn random_seed(rng: &Rng) -> u64 {
    (u64::from(rng.random()) << 32) | u64::from(rng.random())
}

async fn start_portal(radio: &SharedRadio, device: &SharedDevice, config: &AccessPointConfig) {
    match radio.lock().await.start_access_point(config).await {
        Ok(()) => device.lock().await.access_point_started(),
        Err(e) => error!("Access point failed to start: {}", e),
    }
}

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!();

    let hal_config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(hal_config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 66320);
    esp_alloc::heap_allocator!(size: 64 * 1024);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let sw_int = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
    esp_rtos::start(timg0.timer0, sw_int.software_interrupt0);

    info!("voltlog firmware starting");
    let config = firmware_config();

    // -----------------------------------------------------------------------
    // Persistent region in the last flash sector
    // -----------------------------------------------------------------------
    let flash = FlashStorage::new(peripherals.FLASH);
    let base = (flash.capacity() - REGION_SIZE) as u32;
    info!("Persistent region at {:#x}", base);

    let device: &'static SharedDevice = DEVICE.init(Mutex::new(DeviceContext::with_store(
        config.clone(),
        PersistentStore::with_base(flash, base),
    )));
    let mode = match device.lock().await.boot() {
        Ok(mode) => mode,
        Err(e) => {
            error!("Persistent region unavailable: {}", e);
            BootMode::AccessPoint
        }
    };

    // -----------------------------------------------------------------------
    // Radio and the two network stacks
    // -----------------------------------------------------------------------
    let radio_init = RADIO_INIT
        .init(esp_radio::init().expect("Failed to initialize Wi-Fi/BLE controller"));
    let (controller, interfaces) =
        esp_radio::wifi::new(radio_init, peripherals.WIFI, Default::default())
            .expect("Failed to initialize Wi-Fi controller");
    let radio: &'static SharedRadio = RADIO.init(Mutex::new(Radio::new(controller)));

    let rng = Rng::new();
    let (sta_stack, sta_runner) = embassy_net::new(
        interfaces.sta,
        NetConfig::dhcpv4(Default::default()),
        STA_RESOURCES.init(StackResources::new()),
        random_seed(&rng),
    );

    let [a, b, c, d] = config.access_point.address;
    let ap_address = Ipv4Addr::new(a, b, c, d);
    let (ap_stack, ap_runner) = embassy_net::new(
        interfaces.ap,
        NetConfig::ipv4_static(StaticConfigV4 {
            address: Ipv4Cidr::new(ap_address, config.access_point.prefix_len),
            gateway: Some(ap_address),
            dns_servers: Default::default(),
        }),
        AP_RESOURCES.init(StackResources::new()),
        random_seed(&rng),
    );

    spawner.spawn(net_task(sta_runner)).ok();
    spawner.spawn(net_task(ap_runner)).ok();
    spawner
        .spawn(dhcp_server_task(
            ap_stack,
            ap_address,
            config.access_point.prefix_len,
            Ipv4Addr::from(u32::from(ap_address) + 1),
            DHCP_POOL_SIZE,
        ))
        .ok();
    spawner
        .spawn(portal_server_task(
            ap_stack,
            device,
            radio,
            config.timing.restart_delay_ms,
        ))
        .ok();

    // -----------------------------------------------------------------------
    // Station join or portal
    // -----------------------------------------------------------------------
    match &mode {
        BootMode::Station(credentials) => {
            let joined = radio
                .lock()
                .await
                .join(
                    credentials,
                    config.timing.connect_attempts,
                    Duration::from_millis(config.timing.connect_attempt_delay_ms),
                )
                .await
                .unwrap_or_else(|e| {
                    warn!("Station start failed: {}", e);
                    false
                });
            device
                .lock()
                .await
                .station_started(credentials.ssid(), joined);
        }
        BootMode::AccessPoint => start_portal(radio, device, &config.access_point).await,
    }

    // -----------------------------------------------------------------------
    // Main cycle
    // -----------------------------------------------------------------------
    let clock = EmbassyClock;
    let mut sensor = AdcVoltageSensor::new(peripherals.ADC1, peripherals.GPIO4);
    let tcp_state = TCP_STATE.init(ClientState::new());
    let mut link = HttpsLink::new(
        sta_stack,
        tcp_state,
        rng,
        config.timing.time_sync_timeout_ms,
    );

    loop {
        let station_up = {
            let mut radio = radio.lock().await;
            let up = radio.is_station_connected() && sta_stack.is_config_up();
            if !up {
                radio.reconnect();
            }
            up
        };

        let (report, wake_in_ms) = {
            let mut device = device.lock().await;
            let report = device
                .tick(&mut link, &mut sensor, &clock, station_up)
                .await;
            (report, device.next_wake_in_ms(clock.uptime_ms()))
        };

        if report.start_access_point {
            start_portal(radio, device, &config.access_point).await;
        }
        if let Some(Ok(key)) = report.upload {
            info!("Record {} uploaded", key);
        }

        Timer::after(Duration::from_millis(wake_in_ms.max(MIN_WAKE_MS))).await;
    }
}
