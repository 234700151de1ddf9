//! Operator control requests delivered from outside the supervisor
//!
//! The binary translates OS signals into [`ControlRequest`]s. Start and
//! recycle requests run on their own tasks, so a shutdown request is always
//! taken while either is still in flight. The control loop serializes the
//! shutdown behind whatever it is running, which leaves both processes
//! stopped.

use crate::error::SupervisorError;
use crate::supervisor::{Outcome, SupervisorHandle};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// Run the start sequence
    Start,
    /// Recycle the backend now
    Recycle,
    /// Stop both processes and end the control loop
    Shutdown,
}

/// Serve control requests until a shutdown arrives or every sender is gone
///
/// With `auto_start`, the start sequence runs first; a failed initial start
/// shuts the supervisor down and is returned. Requests received while the
/// initial start runs are served too, so a shutdown cuts it short.
pub async fn serve(
    supervisor: SupervisorHandle,
    mut requests: mpsc::Receiver<ControlRequest>,
    auto_start: bool,
) -> Result<(), SupervisorError> {
    let initial = async {
        if auto_start {
            Some(supervisor.start().await)
        } else {
            None
        }
    };
    tokio::pin!(initial);
    let mut initial_done = !auto_start;
    let mut failure = None;

    loop {
        tokio::select! {
            result = &mut initial, if !initial_done => {
                initial_done = true;
                if let Some(Err(e)) = result {
                    error!(kind = e.kind().as_str(), error = %e, "Initial start failed");
                    failure = Some(e);
                    break;
                }
            }
            request = requests.recv() => match request {
                Some(ControlRequest::Start) => {
                    tokio::spawn(start(supervisor.clone()));
                }
                Some(ControlRequest::Recycle) => {
                    tokio::spawn(recycle(supervisor.clone()));
                }
                Some(ControlRequest::Shutdown) => break,
                None => {
                    debug!("Control request channel closed");
                    break;
                }
            }
        }
    }

    info!("Stopping servers...");
    if let Err(e) = supervisor.shutdown().await {
        debug!(error = %e, "Supervisor was already gone");
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn start(supervisor: SupervisorHandle) {
    match supervisor.start().await {
        Ok(outcome) => info!(?outcome, "Start request handled"),
        Err(e) => error!(kind = e.kind().as_str(), error = %e, "Start failed"),
    }
}

async fn recycle(supervisor: SupervisorHandle) {
    match supervisor.recycle_backend_now().await {
        Ok(Outcome::Recycled { count }) => info!(count, "Backend recycled"),
        Ok(outcome) => info!(?outcome, "Backend not recycled"),
        Err(e) => error!(kind = e.kind().as_str(), error = %e, "Backend recycle failed"),
    }
}
