//! The dispatcher: couples inbound control frames to instance mailboxes.
//!
//! Each frame is validated, resolved through the overseer (admission for
//! START, lookup for everything else), and forwarded to the target
//! mailbox. Mailbox sends never block; the loop itself races the done
//! signal, and a frame in flight when shutdown lands is dropped.

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use davit_core::error::{
    AttachError, DeleteError, DetachError, RestartError, StartError, StopError,
};
use davit_core::frame::{ControlFrame, EventFrame, Inbound, WireCommand};
use davit_core::payload;

use crate::instance::InstanceCmd;
use crate::overseer::{AdmitOutcome, OverseerHandle};

pub async fn run(
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    overseer: OverseerHandle,
    outbound: mpsc::UnboundedSender<EventFrame>,
    mut done: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = done.changed() => {
                info!("Dispatcher observed shutdown");
                break;
            }
            frame = inbound.recv() => match frame {
                Some(Inbound::Command(frame)) => {
                    dispatch(frame, &overseer, &outbound).await;
                }
                Some(Inbound::Trace(trace)) => overseer.trace(trace),
                None => {
                    info!("Inbound channel closed");
                    break;
                }
            },
        }
    }
}

async fn dispatch(
    frame: ControlFrame,
    overseer: &OverseerHandle,
    outbound: &mpsc::UnboundedSender<EventFrame>,
) {
    debug!(command = ?frame.command, correlation = %frame.correlation, "Dispatching");
    match frame.command {
        WireCommand::Start => dispatch_start(frame, overseer, outbound).await,
        WireCommand::Restart => dispatch_restart(frame, overseer, outbound).await,
        WireCommand::Stop => dispatch_stop(frame, overseer, outbound).await,
        WireCommand::Delete => dispatch_delete(frame, overseer, outbound).await,
        WireCommand::AttachVolume => dispatch_attach(frame, overseer, outbound).await,
        WireCommand::DetachVolume => dispatch_detach(frame, overseer, outbound).await,
    }
}

fn emit(outbound: &mpsc::UnboundedSender<EventFrame>, frame: EventFrame) {
    let _ = outbound.send(frame);
}

async fn dispatch_start(
    frame: ControlFrame,
    overseer: &OverseerHandle,
    outbound: &mpsc::UnboundedSender<EventFrame>,
) {
    let request = match payload::parse_start(&frame.payload) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "START payload rejected");
            emit(
                outbound,
                EventFrame::StartFailure {
                    correlation: frame.correlation,
                    instance_uuid: payload::instance_uuid_hint(&frame.payload),
                    reason: StartError::from(&e),
                },
            );
            return;
        }
    };

    let instance_id = request.config.instance_id;
    let mailbox = match overseer.admit(request.config, false).await {
        AdmitOutcome::Admitted(mailbox) | AdmitOutcome::Existing(mailbox) => mailbox,
        AdmitOutcome::Full => {
            emit(
                outbound,
                EventFrame::StartFailure {
                    correlation: frame.correlation,
                    instance_uuid: instance_id,
                    reason: StartError::FullComputeNode,
                },
            );
            return;
        }
        AdmitOutcome::Failed => {
            emit(
                outbound,
                EventFrame::StartFailure {
                    correlation: frame.correlation,
                    instance_uuid: instance_id,
                    reason: StartError::LaunchFailure,
                },
            );
            return;
        }
    };

    let cmd = InstanceCmd::Start {
        user_data: request.user_data,
        meta_data: request.meta_data,
        correlation: frame.correlation,
    };
    if mailbox.send(cmd).is_err() {
        emit(
            outbound,
            EventFrame::StartFailure {
                correlation: frame.correlation,
                instance_uuid: instance_id,
                reason: StartError::LaunchFailure,
            },
        );
    }
}

async fn dispatch_restart(
    frame: ControlFrame,
    overseer: &OverseerHandle,
    outbound: &mpsc::UnboundedSender<EventFrame>,
) {
    let instance_id = match payload::parse_instance_ref(&frame.payload) {
        Ok(id) => id,
        Err(e) => {
            emit(
                outbound,
                EventFrame::RestartFailure {
                    correlation: frame.correlation,
                    instance_uuid: payload::instance_uuid_hint(&frame.payload),
                    reason: RestartError::from(&e),
                },
            );
            return;
        }
    };
    let fail = |reason| EventFrame::RestartFailure {
        correlation: frame.correlation,
        instance_uuid: instance_id,
        reason,
    };
    match overseer.lookup(instance_id).await {
        Some(target) => {
            let cmd = InstanceCmd::Restart {
                correlation: frame.correlation,
            };
            if target.mailbox.send(cmd).is_err() {
                emit(outbound, fail(RestartError::NoInstance));
            }
        }
        None => emit(outbound, fail(RestartError::NoInstance)),
    }
}

async fn dispatch_stop(
    frame: ControlFrame,
    overseer: &OverseerHandle,
    outbound: &mpsc::UnboundedSender<EventFrame>,
) {
    let instance_id = match payload::parse_instance_ref(&frame.payload) {
        Ok(id) => id,
        Err(e) => {
            emit(
                outbound,
                EventFrame::StopFailure {
                    correlation: frame.correlation,
                    instance_uuid: payload::instance_uuid_hint(&frame.payload),
                    reason: StopError::from(&e),
                },
            );
            return;
        }
    };
    let fail = |reason| EventFrame::StopFailure {
        correlation: frame.correlation,
        instance_uuid: instance_id,
        reason,
    };
    match overseer.lookup(instance_id).await {
        Some(target) => {
            let cmd = InstanceCmd::Stop {
                correlation: frame.correlation,
            };
            if target.mailbox.send(cmd).is_err() {
                emit(outbound, fail(StopError::NoInstance));
            }
        }
        None => emit(outbound, fail(StopError::NoInstance)),
    }
}

async fn dispatch_delete(
    frame: ControlFrame,
    overseer: &OverseerHandle,
    outbound: &mpsc::UnboundedSender<EventFrame>,
) {
    let request = match payload::parse_delete(&frame.payload) {
        Ok(request) => request,
        Err(e) => {
            emit(
                outbound,
                EventFrame::DeleteFailure {
                    correlation: frame.correlation,
                    instance_uuid: payload::instance_uuid_hint(&frame.payload),
                    reason: DeleteError::from(&e),
                },
            );
            return;
        }
    };
    let fail = || EventFrame::DeleteFailure {
        correlation: frame.correlation,
        instance_uuid: request.instance_id,
        reason: DeleteError::NoInstance,
    };
    match overseer.lookup(request.instance_id).await {
        Some(target) => {
            let cmd = InstanceCmd::Delete {
                correlation: frame.correlation,
                migration: request.migration,
                suicide: frame.suicide,
            };
            if target.mailbox.send(cmd).is_err() {
                emit(outbound, fail());
            }
        }
        // Deleting an unknown instance is a no-op with a failure frame.
        None => emit(outbound, fail()),
    }
}

async fn dispatch_attach(
    frame: ControlFrame,
    overseer: &OverseerHandle,
    outbound: &mpsc::UnboundedSender<EventFrame>,
) {
    let request = match payload::parse_volume_ref(&frame.payload) {
        Ok(request) => request,
        Err(e) => {
            emit(
                outbound,
                EventFrame::AttachVolumeFailure {
                    correlation: frame.correlation,
                    instance_uuid: payload::instance_uuid_hint(&frame.payload),
                    volume_uuid: Uuid::nil(),
                    reason: AttachError::from(&e),
                },
            );
            return;
        }
    };
    let fail = || EventFrame::AttachVolumeFailure {
        correlation: frame.correlation,
        instance_uuid: request.instance_id,
        volume_uuid: request.volume_id,
        reason: AttachError::InstanceFailure,
    };
    match overseer.lookup(request.instance_id).await {
        Some(target) => {
            let cmd = InstanceCmd::Attach {
                volume_id: request.volume_id,
                correlation: frame.correlation,
            };
            if target.mailbox.send(cmd).is_err() {
                emit(outbound, fail());
            }
        }
        None => emit(outbound, fail()),
    }
}

async fn dispatch_detach(
    frame: ControlFrame,
    overseer: &OverseerHandle,
    outbound: &mpsc::UnboundedSender<EventFrame>,
) {
    let request = match payload::parse_volume_ref(&frame.payload) {
        Ok(request) => request,
        Err(e) => {
            emit(
                outbound,
                EventFrame::DetachVolumeFailure {
                    correlation: frame.correlation,
                    instance_uuid: payload::instance_uuid_hint(&frame.payload),
                    volume_uuid: Uuid::nil(),
                    reason: DetachError::from(&e),
                },
            );
            return;
        }
    };
    let fail = || EventFrame::DetachVolumeFailure {
        correlation: frame.correlation,
        instance_uuid: request.instance_id,
        volume_uuid: request.volume_id,
        reason: DetachError::InstanceFailure,
    };
    match overseer.lookup(request.instance_id).await {
        Some(target) => {
            let cmd = InstanceCmd::Detach {
                volume_id: request.volume_id,
                correlation: frame.correlation,
            };
            if target.mailbox.send(cmd).is_err() {
                emit(outbound, fail());
            }
        }
        None => emit(outbound, fail()),
    }
}
