#[cfg(target_os = "espidf")]
use esp_idf_sys as sys;

#[cfg(target_os = "espidf")]
sys::esp_app_desc!();

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    use climate_node::configuration::{ConfigStore, Configuration};
    use climate_node::controller::{Board, DutyCycleController};
    use climate_node::dht22::Dht22;
    use climate_node::peripherals::SystemPeripherals;
    use climate_node::services::httpd::PortalProvisioner;
    use climate_node::services::mqtt::EspBroker;
    use climate_node::services::nvs::NvsConfigStore;
    use climate_node::services::power::EspPower;
    use climate_node::services::wifi::EspRadio;
    use esp_idf_hal::delay::{Ets, FreeRtos};
    use esp_idf_hal::gpio::{PinDriver, Pull};
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use esp_idf_svc::wifi::EspWifi;
    use log::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    let peripherals = SystemPeripherals::take()?;
    let nvs_default_partition = EspDefaultNvsPartition::take()?;
    let sysloop = EspSystemEventLoop::take()?;

    let mut store = NvsConfigStore::new(nvs_default_partition.clone())?;
    let first_run = matches!(store.load(), Ok(None));
    let config = Configuration::load(&mut store);

    let wifi = Rc::new(RefCell::new(EspWifi::new(
        peripherals.modem,
        sysloop,
        Some(nvs_default_partition),
    )?));

    let mut override_switch = PinDriver::input(peripherals.override_switch)?;
    override_switch.set_pull(Pull::Up)?;

    let board = Board {
        sensors: [
            Dht22::new(PinDriver::input_output_od(peripherals.sensors.dht1)?, Ets),
            Dht22::new(PinDriver::input_output_od(peripherals.sensors.dht2)?, Ets),
        ],
        radio: EspRadio::new(wifi.clone()),
        broker: EspBroker::new(),
        override_switch,
        delay: FreeRtos,
        power: EspPower::new(),
    };

    let mut controller = DutyCycleController::new(
        config,
        board,
        Box::new(store),
        Box::new(PortalProvisioner::new(wifi, first_run)),
    )?;

    let reason = controller.run();
    error!("Duty cycle stopped: {reason}");

    Ok(())
}

#[cfg(not(target_os = "espidf"))]
fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    climate_node::simulator::run()
}
