use crate::daemon::polling::LoopEvent;
use futures_util::StreamExt;
use tokio::sync::mpsc;

/// NM_STATE_CONNECTED_GLOBAL
const NM_CONNECTED_GLOBAL: u32 = 70;

#[zbus::proxy(
    interface = "org.freedesktop.login1.Manager",
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1"
)]
trait LoginManager {
    #[zbus(signal)]
    fn prepare_for_sleep(&self, start: bool) -> zbus::Result<()>;
}

#[zbus::proxy(
    interface = "org.freedesktop.NetworkManager",
    default_service = "org.freedesktop.NetworkManager",
    default_path = "/org/freedesktop/NetworkManager"
)]
trait NetworkManager {
    #[zbus(name = "state")]
    fn state(&self) -> zbus::Result<u32>;

    #[zbus(signal)]
    fn state_changed(&self, state: u32) -> zbus::Result<()>;
}

/// Subscribes to suspend/resume and connectivity changes on the system bus.
/// Missing services only disable the matching events.
pub fn spawn_system_watchers(events: mpsc::UnboundedSender<LoopEvent>) {
    tokio::spawn(async move {
        let connection = match zbus::Connection::system().await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(error = %e, "System bus unavailable, sleep and network events disabled");
                return;
            }
        };

        let (sleep, network) = tokio::join!(
            watch_sleep(&connection, events.clone()),
            watch_network(&connection, events),
        );
        if let Err(e) = sleep {
            tracing::warn!(error = %e, "Stopped watching login1 sleep signals");
        }
        if let Err(e) = network {
            tracing::warn!(error = %e, "Stopped watching NetworkManager state");
        }
    });
}

async fn watch_sleep(
    connection: &zbus::Connection,
    events: mpsc::UnboundedSender<LoopEvent>,
) -> zbus::Result<()> {
    let proxy = LoginManagerProxy::new(connection).await?;
    let mut signals = proxy.receive_prepare_for_sleep().await?;
    tracing::debug!("Watching login1 PrepareForSleep");

    while let Some(signal) = signals.next().await {
        let args = signal.args()?;
        let event = if *args.start() {
            LoopEvent::Suspend
        } else {
            LoopEvent::Wake
        };
        if events.send(event).is_err() {
            break;
        }
    }
    Ok(())
}

async fn watch_network(
    connection: &zbus::Connection,
    events: mpsc::UnboundedSender<LoopEvent>,
) -> zbus::Result<()> {
    let proxy = NetworkManagerProxy::new(connection).await?;
    let mut connected = match proxy.state().await {
        Ok(state) => is_connected(state),
        Err(e) => {
            tracing::debug!(error = %e, "Could not read NetworkManager state, assuming online");
            true
        }
    };
    if !connected && events.send(LoopEvent::NetworkLost).is_err() {
        return Ok(());
    }

    let mut signals = proxy.receive_state_changed().await?;
    tracing::debug!(connected, "Watching NetworkManager StateChanged");

    while let Some(signal) = signals.next().await {
        let state = *signal.args()?.state();
        let Some(event) = network_transition(connected, state) else {
            continue;
        };
        connected = is_connected(state);
        if events.send(event).is_err() {
            break;
        }
    }
    Ok(())
}

fn is_connected(state: u32) -> bool {
    state >= NM_CONNECTED_GLOBAL
}

fn network_transition(was_connected: bool, state: u32) -> Option<LoopEvent> {
    match (was_connected, is_connected(state)) {
        (true, false) => Some(LoopEvent::NetworkLost),
        (false, true) => Some(LoopEvent::NetworkRestored),
        _ => None,
    }
}
