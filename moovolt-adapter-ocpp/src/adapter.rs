//! Charge point adapter runtime
//!
//! Bridges one station connection and the session bus.
//!
//! ```text
//!        Charging station
//!              │ WebSocket OCPP 2.0.1
//!              ▼
//! ┌───────────────────────────────┐
//! │  Adapter                      │
//! │  ┌──────────────┐  ┌───────┐  │
//! │  │ Station      │◄►│ Trans-│  │
//! │  │ Connection   │  │ lator │  │
//! │  └──────────────┘  └───────┘  │
//! └──────┬─────────────────▲──────┘
//!        │ station-events.<shard>   station-commands.<station>
//!        ▼                 │
//!            Session bus (Gateway)
//! ```
//!
//! ## Message Flow
//!
//! 1. Station CALL is answered and translated into a domain event
//! 2. Event is published to the shard topic of the station
//! 3. Coordinator publishes a command on the station's command topic
//! 4. Adapter executes it as a station CALL
//! 5. Bus delivery is acked once the station answered

use moovolt_core::bus::{BusError, DeliveryError};
use moovolt_core::{topics, ChargePointId, DedupeWindow, Delivery, DomainCommand, Gateway, Subscription};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AdapterConfig;
use crate::connection::{CommandSender, ConnectionError, StationConnection};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Station connection: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Bus: {0}")]
    Bus(#[from] BusError),
}

/// Adapter for one charging station
pub struct Adapter {
    config: AdapterConfig,
    gateway: Gateway,
}

impl Adapter {
    pub fn new(config: AdapterConfig, gateway: Gateway) -> Self {
        Self { config, gateway }
    }

    pub fn station(&self) -> &ChargePointId {
        &self.config.identity.id
    }

    /// Run until cancelled or the bus goes away
    pub async fn run(self, cancel: CancellationToken) -> Result<(), AdapterError> {
        let cancel = cancel.child_token();
        let station = self.config.identity.id.clone();
        info!("Adapter {}: starting ({})", station, self.config.identity.endpoint);

        let mut connection = StationConnection::connect(
            self.config.identity.clone(),
            self.config.connection.clone(),
            cancel.child_token(),
        )
        .await?;

        let commands = self
            .gateway
            .subscribe(&topics::station_commands(&station), &self.config.group)
            .await?;

        let executor = CommandExecutor {
            station: station.clone(),
            sender: connection.commands(),
            executed: DedupeWindow::new(self.config.dedupe_window),
        };
        let command_task = tokio::spawn(executor.run(commands, cancel.clone()));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                event = connection.receive_event() => {
                    let Some(event) = event else {
                        warn!("Adapter {}: station link stopped", station);
                        break;
                    };
                    debug!("Adapter {}: {} ({})", station, event.kind.name(), event.correlation_id);
                    if let Err(e) = self.gateway.publish_event(&event).await {
                        error!(
                            "Adapter {}: lost {} ({}): {}",
                            station, event.kind.name(), event.correlation_id, e
                        );
                    }
                }
            }
        }

        cancel.cancel();
        let _ = command_task.await;
        info!("Adapter {}: stopped", station);
        Ok(())
    }
}

/// Executes bus commands on the station, one at a time
struct CommandExecutor {
    station: ChargePointId,
    sender: CommandSender,
    /// Correlation ids the station already acknowledged
    executed: DedupeWindow,
}

impl CommandExecutor {
    async fn run(mut self, mut commands: Subscription, cancel: CancellationToken) {
        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => return,
                delivery = commands.next() => delivery,
            };
            match delivery {
                Some(delivery) => self.execute(delivery).await,
                None => {
                    warn!("Adapter {}: command subscription closed", self.station);
                    cancel.cancel();
                    return;
                }
            }
        }
    }

    async fn execute(&mut self, delivery: Delivery) {
        let command = match DomainCommand::from_envelope(delivery.envelope()) {
            Ok(command) => command,
            Err(e) => {
                warn!(
                    "Adapter {}: dropping malformed command {}: {}",
                    self.station,
                    delivery.envelope().correlation_id,
                    e
                );
                delivery.ack();
                return;
            }
        };

        if command.charge_point_id != self.station {
            warn!(
                "Adapter {}: command {} addressed to {}",
                self.station, command.correlation_id, command.charge_point_id
            );
            delivery.ack();
            return;
        }

        if self.executed.contains(&command.correlation_id) {
            info!(
                "Adapter {}: duplicate {} ({}), already executed",
                self.station,
                command.kind.name(),
                command.correlation_id
            );
            delivery.ack();
            return;
        }

        match self.sender.send_command(&command).await {
            Ok(ack) => {
                if ack.accepted {
                    info!("Adapter {}: {} accepted ({})", self.station, command.kind.name(), ack.correlation_id);
                } else {
                    warn!("Adapter {}: {} not accepted ({})", self.station, command.kind.name(), ack.correlation_id);
                }
                self.executed.insert(&command.correlation_id);
                delivery.ack();
            }
            // Station answered with CALLERROR, or the command cannot be encoded
            Err(e @ (DeliveryError::Rejected(_) | DeliveryError::Encoding(_))) => {
                error!(
                    "Adapter {}: {} ({}) failed: {}",
                    self.station,
                    command.kind.name(),
                    command.correlation_id,
                    e
                );
                delivery.ack();
            }
            Err(e) => {
                warn!(
                    "Adapter {}: {} ({}) not delivered (attempt {}): {}",
                    self.station,
                    command.kind.name(),
                    command.correlation_id,
                    delivery.attempt(),
                    e
                );
                delivery.nack();
            }
        }
    }
}
