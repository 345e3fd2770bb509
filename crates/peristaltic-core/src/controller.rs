//! Pump controller connection
//!
//! The [`Controller`] opens the link, starts the transport and creates one
//! [`Pump`] per configured channel. Pumps share the transport, so requests
//! from different channels are serialized on the wire.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{DeviceConfig, PumpConfig};
use crate::motor::StepTiming;
use crate::protocol::{
    list_ports, CommunicationChannel, PortInfo, ProtocolError, SerialChannel, Transport,
    TransportStats, CHANNEL_COUNT, COMMAND_TABLE,
};
use crate::pump::{Pump, PumpError};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Bringing up the link and reading initial state
    Connecting,
    /// Connected and ready
    Connected,
    /// Last connection attempt failed
    Error,
}

/// Errors from controller operations
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Not connected to pump controller")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Configured {requested} pumps, the controller drives at most {max}")]
    TooManyPumps { requested: usize, max: usize },

    #[error("Pump {0} does not exist")]
    PumpIndexOutOfRange(usize),

    #[error("Controller reported a sub-microsecond divider of zero")]
    InvalidDivider,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Pump(#[from] PumpError),
}

/// Connected pump controller
pub struct Controller {
    config: DeviceConfig,
    state: ConnectionState,
    transport: Option<Arc<Transport>>,
    pumps: Vec<Arc<Pump>>,
    timing: StepTiming,
}

impl Controller {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            transport: None,
            pumps: Vec::new(),
            timing: StepTiming::default(),
        }
    }

    /// Available serial ports
    pub fn list_ports() -> Vec<PortInfo> {
        list_ports()
    }

    /// Configuration the controller was created with
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Step timing reported by the controller
    pub fn timing(&self) -> StepTiming {
        self.timing
    }

    /// Open the configured serial port and bring up every pump
    pub async fn connect(&mut self) -> Result<(), ControllerError> {
        if self.state == ConnectionState::Connected {
            return Err(ControllerError::AlreadyConnected);
        }

        self.check_pump_count()?;

        let settings = self.config.transport.clone();
        let transport_config = settings.transport_config();
        let port_name = self.config.device.serial_port.clone();
        info!(
            "Connecting to {} at {} baud",
            port_name, self.config.device.serial_baudrate
        );

        let channel = match SerialChannel::open(
            &port_name,
            Some(self.config.device.serial_baudrate),
            Some(transport_config.inter_byte_timeout),
        ) {
            Ok(channel) => channel,
            Err(e) => {
                self.state = ConnectionState::Error;
                error!("Could not open {}: {}", port_name, e);
                return Err(e.into());
            }
        };

        // the controller resets when the port opens
        if !settings.wait_for_boot {
            tokio::time::sleep(settings.connect_delay()).await;
        }

        self.connect_with(Box::new(channel)).await
    }

    /// Bring up the controller over an already opened channel
    pub async fn connect_with(
        &mut self,
        channel: Box<dyn CommunicationChannel>,
    ) -> Result<(), ControllerError> {
        if self.state == ConnectionState::Connected {
            return Err(ControllerError::AlreadyConnected);
        }
        self.check_pump_count()?;

        self.state = ConnectionState::Connecting;
        match self.bring_up(channel).await {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                info!("{} pumps initialized", self.pumps.len());
                Ok(())
            }
            Err(e) => {
                error!("Could not connect to the pump controller: {}", e);
                self.teardown();
                self.state = ConnectionState::Error;
                Err(e)
            }
        }
    }

    fn check_pump_count(&mut self) -> Result<(), ControllerError> {
        if self.config.pump_count > CHANNEL_COUNT {
            self.state = ConnectionState::Error;
            return Err(ControllerError::TooManyPumps {
                requested: self.config.pump_count,
                max: CHANNEL_COUNT,
            });
        }
        Ok(())
    }

    async fn bring_up(&mut self, mut channel: Box<dyn CommunicationChannel>) -> Result<(), ControllerError> {
        let settings = self.config.transport.clone();

        // the boot frame may already be buffered when waiting for it
        if !settings.wait_for_boot {
            channel.clear_input_buffer().map_err(ProtocolError::from)?;
        }
        let transport = Arc::new(Transport::start(channel, settings.transport_config())?);
        self.transport = Some(transport.clone());

        if settings.wait_for_boot {
            transport.wait_for_boot(settings.connect_delay()).await?;
        }

        let divider = transport.get(COMMAND_TABLE.sub_us_divider()).await?;
        if divider == 0 {
            return Err(ControllerError::InvalidDivider);
        }
        self.timing = StepTiming::new(divider);
        info!("Connected to the pump controller (sub-us divider {})", divider);

        for channel in 0..self.config.pump_count {
            let pump = Pump::new(
                channel,
                transport.clone(),
                self.timing,
                self.config.pump(channel).calibration(),
                settings.finish_timeout(),
            )?;
            pump.route_finished();
            self.pumps.push(pump);
        }

        // read back before the stored calibration limits apply
        for pump in &self.pumps {
            pump.refresh().await?;
        }
        Ok(())
    }

    fn teardown(&mut self) {
        self.pumps.clear();
        if let Some(transport) = self.transport.take() {
            transport.clear_routes();
            transport.shutdown();
        }
    }

    /// Close the link. Pumps handed out earlier fail with `ConnectionClosed`.
    ///
    /// Inside a tokio runtime the receiver thread is joined in the background,
    /// so the port may stay open for one more inter-byte timeout. Outside a
    /// runtime this blocks until the thread exits. See [`close`](Self::close).
    pub fn disconnect(&mut self) {
        if self.transport.is_some() {
            self.teardown();
            info!("Disconnected from the pump controller");
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Close the link and wait until the port is released
    pub async fn close(&mut self) {
        self.pumps.clear();
        if let Some(transport) = self.transport.take() {
            transport.clear_routes();
            transport.close().await;
            info!("Disconnected from the pump controller");
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Pump of a channel (0-based)
    pub fn pump(&self, channel: usize) -> Result<&Arc<Pump>, ControllerError> {
        if !self.is_connected() {
            return Err(ControllerError::NotConnected);
        }
        self.pumps
            .get(channel)
            .ok_or(ControllerError::PumpIndexOutOfRange(channel))
    }

    /// All pumps, empty while disconnected
    pub fn pumps(&self) -> &[Arc<Pump>] {
        &self.pumps
    }

    pub fn pump_count(&self) -> usize {
        self.pumps.len()
    }

    /// Link counters, `None` while disconnected
    pub fn transport_stats(&self) -> Option<TransportStats> {
        self.transport.as_ref().map(|t| t.stats())
    }

    /// Stop every pump. All pumps are tried; the first failure is returned.
    pub async fn stop_all(&self) -> Result<(), ControllerError> {
        if !self.is_connected() {
            return Err(ControllerError::NotConnected);
        }
        let mut first_error = None;
        for pump in &self.pumps {
            if let Err(e) = pump.pump_stop().await {
                error!("Could not stop pump {}: {}", pump.channel(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Disable every motor driver, which also stops it
    pub async fn emergency_stop(&self) -> Result<(), ControllerError> {
        if !self.is_connected() {
            return Err(ControllerError::NotConnected);
        }
        let mut first_error = None;
        for pump in &self.pumps {
            match pump.set_enabled(false).await {
                Ok(()) => warn!("Pump {} disabled by emergency stop", pump.channel()),
                Err(e) => {
                    error!("Could not emergency stop pump {}: {}", pump.channel(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Configuration with the pumps' current calibration
    pub fn config_snapshot(&self) -> DeviceConfig {
        let mut config = self.config.clone();
        for pump in &self.pumps {
            config.set_pump(pump.channel(), PumpConfig::from_calibration(&pump.calibration()));
        }
        config
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.disconnect();
    }
}
