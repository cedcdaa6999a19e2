//! Host systemd access over D-Bus: query unit state, stop GPU-client
//! services before a reconfigure, and start them again afterwards in LIFO
//! order.

use std::time::Duration;

use log::{debug, info};
use snafu::ResultExt;
use zbus::dbus_proxy;
use zbus::zvariant::OwnedObjectPath;

const STOP_TIMEOUT: Duration = Duration::from_secs(30);
const START_TIMEOUT: Duration = Duration::from_secs(120);

#[dbus_proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
trait Systemd1Manager {
    fn start_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn restart_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn load_unit(&self, name: &str) -> zbus::Result<OwnedObjectPath>;

    fn reload(&self) -> zbus::Result<()>;
}

#[dbus_proxy(
    interface = "org.freedesktop.systemd1.Unit",
    default_service = "org.freedesktop.systemd1"
)]
trait Systemd1Unit {
    #[dbus_proxy(property)]
    fn active_state(&self) -> zbus::Result<String>;

    #[dbus_proxy(property)]
    fn load_state(&self) -> zbus::Result<String>;

    #[dbus_proxy(property)]
    fn unit_file_state(&self) -> zbus::Result<String>;
}

#[dbus_proxy(
    interface = "org.freedesktop.systemd1.Service",
    default_service = "org.freedesktop.systemd1"
)]
trait Systemd1Service {
    #[dbus_proxy(property, name = "Type")]
    fn service_type(&self) -> zbus::Result<String>;
}

/// What to do with a GPU-client service around a reconfigure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    /// Stop it now and start it again afterwards.
    StopAndRestart,
    /// Not running, but enabled and failed: start it afterwards.
    RestartOnly,
    /// Leave it alone.
    Skip,
}

/// Decide how to treat a service from its unit state. Oneshot and
/// not-found units are never touched; disabled units stay down.
pub fn service_action(
    load_state: &str,
    active_state: &str,
    unit_file_state: &str,
    service_type: &str,
) -> ServiceAction {
    if load_state != "loaded" || service_type == "oneshot" {
        return ServiceAction::Skip;
    }
    match active_state {
        "active" | "activating" | "reloading" => ServiceAction::StopAndRestart,
        "failed" if unit_file_state == "enabled" => ServiceAction::RestartOnly,
        _ => ServiceAction::Skip,
    }
}

/// Services to start again after the reconfigure, most recently stopped
/// first.
#[derive(Debug, Default)]
pub struct RestartStack {
    services: Vec<String>,
}

impl RestartStack {
    pub fn push(&mut self, service: &str) {
        self.services.push(service.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Drain in LIFO order.
    pub fn drain(&mut self) -> Vec<String> {
        let mut services = std::mem::take(&mut self.services);
        services.reverse();
        services
    }
}

pub struct Systemd {
    connection: zbus::Connection,
}

impl Systemd {
    pub async fn system() -> Result<Self> {
        let connection = zbus::Connection::system()
            .await
            .context(error::ConnectSnafu)?;
        Ok(Self { connection })
    }

    async fn manager(&self) -> Result<Systemd1ManagerProxy<'_>> {
        Systemd1ManagerProxy::new(&self.connection)
            .await
            .context(error::ProxySnafu)
    }

    async fn action_for(&self, service: &str) -> Result<ServiceAction> {
        let manager = self.manager().await?;
        let path = match manager.load_unit(service).await {
            Ok(path) => path,
            Err(e) => {
                debug!("unable to load unit {}: {}", service, e);
                return Ok(ServiceAction::Skip);
            }
        };

        let unit = Systemd1UnitProxy::builder(&self.connection)
            .path(path.clone())
            .context(error::ProxySnafu)?
            .build()
            .await
            .context(error::ProxySnafu)?;
        let load_state = unit.load_state().await.context(error::UnitStateSnafu {
            service,
            property: "LoadState",
        })?;
        let active_state = unit.active_state().await.context(error::UnitStateSnafu {
            service,
            property: "ActiveState",
        })?;
        let unit_file_state = unit.unit_file_state().await.unwrap_or_default();

        let service_proxy = Systemd1ServiceProxy::builder(&self.connection)
            .path(path)
            .context(error::ProxySnafu)?
            .build()
            .await
            .context(error::ProxySnafu)?;
        let service_type = service_proxy.service_type().await.unwrap_or_default();

        Ok(service_action(
            &load_state,
            &active_state,
            &unit_file_state,
            &service_type,
        ))
    }

    /// Stop the listed GPU clients, remembering which ones to bring back.
    pub async fn stop_gpu_clients(&self, services: &[String]) -> Result<RestartStack> {
        let mut stack = RestartStack::default();
        for service in services {
            match self.action_for(service).await? {
                ServiceAction::Skip => {
                    debug!("leaving {} alone", service);
                }
                ServiceAction::RestartOnly => {
                    info!("{} is failed but enabled; will restart it", service);
                    stack.push(service);
                }
                ServiceAction::StopAndRestart => {
                    info!("stopping {}", service);
                    self.stop(service).await?;
                    stack.push(service);
                }
            }
        }
        Ok(stack)
    }

    pub async fn stop(&self, service: &str) -> Result<()> {
        let manager = self.manager().await?;
        match tokio::time::timeout(STOP_TIMEOUT, manager.stop_unit(service, "replace")).await {
            Ok(result) => {
                result.context(error::UnitSnafu { op: "stop", service })?;
                Ok(())
            }
            Err(_) => error::UnitTimeoutSnafu { op: "stop", service }.fail(),
        }
    }

    pub async fn start(&self, service: &str) -> Result<()> {
        let manager = self.manager().await?;
        match tokio::time::timeout(START_TIMEOUT, manager.start_unit(service, "replace")).await {
            Ok(result) => {
                result.context(error::UnitSnafu { op: "start", service })?;
                Ok(())
            }
            Err(_) => error::UnitTimeoutSnafu { op: "start", service }.fail(),
        }
    }

    pub async fn restart(&self, service: &str) -> Result<()> {
        let manager = self.manager().await?;
        match tokio::time::timeout(START_TIMEOUT, manager.restart_unit(service, "replace")).await
        {
            Ok(result) => {
                result.context(error::UnitSnafu {
                    op: "restart",
                    service,
                })?;
                Ok(())
            }
            Err(_) => error::UnitTimeoutSnafu {
                op: "restart",
                service,
            }
            .fail(),
        }
    }

    /// Start the remembered services again, most recently stopped first.
    pub async fn restart_gpu_clients(&self, stack: &mut RestartStack) -> Result<()> {
        for service in stack.drain() {
            info!("starting {}", service);
            self.start(&service).await?;
        }
        Ok(())
    }

    pub async fn daemon_reload(&self) -> Result<()> {
        let manager = self.manager().await?;
        manager.reload().await.context(error::UnitSnafu {
            op: "daemon-reload",
            service: "systemd",
        })
    }
}

type Result<T, E = error::Error> = std::result::Result<T, E>;

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Unable to connect to the system bus: {}", source))]
        Connect { source: zbus::Error },

        #[snafu(display("Unable to build systemd proxy: {}", source))]
        Proxy { source: zbus::Error },

        #[snafu(display("Unable to read {} of {}: {}", property, service, source))]
        UnitState {
            service: String,
            property: String,
            source: zbus::Error,
        },

        #[snafu(display("Unable to {} {}: {}", op, service, source))]
        Unit {
            op: String,
            service: String,
            source: zbus::Error,
        },

        #[snafu(display("Timed out waiting to {} {}", op, service))]
        UnitTimeout { op: String, service: String },
    }
}

pub use error::Error;

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    #[test_case("loaded", "active", "enabled", "notify", ServiceAction::StopAndRestart; "active service")]
    #[test_case("loaded", "activating", "enabled", "simple", ServiceAction::StopAndRestart; "activating service")]
    #[test_case("loaded", "failed", "enabled", "simple", ServiceAction::RestartOnly; "failed but enabled")]
    #[test_case("loaded", "failed", "disabled", "simple", ServiceAction::Skip; "failed and disabled")]
    #[test_case("loaded", "inactive", "enabled", "simple", ServiceAction::Skip; "inactive")]
    #[test_case("not-found", "inactive", "", "", ServiceAction::Skip; "not found")]
    #[test_case("loaded", "active", "enabled", "oneshot", ServiceAction::Skip; "oneshot")]
    fn service_actions(
        load_state: &str,
        active_state: &str,
        unit_file_state: &str,
        service_type: &str,
        expected: ServiceAction,
    ) {
        assert_eq!(
            service_action(load_state, active_state, unit_file_state, service_type),
            expected
        );
    }

    #[test]
    fn restart_stack_is_lifo() {
        let mut stack = RestartStack::default();
        stack.push("a.service");
        stack.push("b.service");
        stack.push("c.service");
        assert_eq!(stack.drain(), ["c.service", "b.service", "a.service"]);
        assert!(stack.is_empty());
    }
}
