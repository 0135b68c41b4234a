//! Maps inbound RPC messages onto the application manager's lifecycle
//! calls and the resource manager's event queue — spec.md §4.G: "Maps
//! incoming RPC messages onto C's lifecycle calls; serves outbound
//! sync-protocol requests" (the outbound half lives in
//! [`crate::sync::SynchronizationManager`]).
//!
//! Grounded on `bbque/application_proxy.cc`'s message switchboard: pairing
//! and exit are handled synchronously on the dispatcher path (§4.G), every
//! other message type is handed to one of a pool of per-request workers —
//! modelled here as one spawned task per [`dispatch_one`] call.

use crate::app::constraint::BoundType;
use crate::app_manager::ApplicationManager;
use crate::ids::AppUid;
use crate::proxy::protocol::{RpcHeader, RpcMessage, RtlibExitCode};
use crate::proxy::ApplicationProxy;
use crate::resource_manager::{ResourceManager, EXC_START};
use crate::resources::ResourceAccounter;

use tokio::sync::Mutex;
use tracing::{info, warn};

fn uid_of(header: &RpcHeader) -> AppUid {
    AppUid::new(header.app_pid, header.exc_id)
}

async fn respond(proxy: &ApplicationProxy, header: RpcHeader, reply: RpcMessage) {
    if let Err(e) = proxy.send(header.app_pid, header, reply).await {
        warn!(pid = header.app_pid, error = %e, "failed to send RPC response");
    }
}

/// Handle one inbound (header, message) pair against the shared
/// application manager / accounter / proxy. `APP_PAIR` is expected to
/// have already attached the transport connection via
/// [`ApplicationProxy::pair`] before this is called — this function only
/// handles the logical pairing acknowledgement and every other message
/// family.
pub async fn dispatch_one(
    header: RpcHeader,
    message: RpcMessage,
    app_manager: &ApplicationManager,
    accounter: &Mutex<ResourceAccounter>,
    proxy: &ApplicationProxy,
    recipe_loader: &dyn crate::app::recipe::RecipeLoader,
    resource_manager: &ResourceManager,
) {
    let uid = uid_of(&header);
    match message {
        RpcMessage::Pair { rtlib_version } => {
            info!(pid = header.app_pid, rtlib_version, "application pair acknowledged");
            respond(proxy, header, RpcMessage::BbqResp { code: RtlibExitCode::Ok }).await;
        }

        RpcMessage::Exit => {
            for uid in app_manager.uids_for_pid(header.app_pid).await {
                resource_manager.request_stop(uid).await;
            }
            proxy.exit(header.app_pid).await;
        }

        RpcMessage::RegisterExc { name, recipe, priority } => {
            let guard = accounter.lock().await;
            let result = app_manager
                .create_exc(uid, &name, &recipe, priority, false, recipe_loader, &guard)
                .await;
            drop(guard);
            let code = if result.is_ok() { RtlibExitCode::Ok } else { RtlibExitCode::Rejected };
            if let Err(e) = result {
                warn!(%uid, error = %e, "execution context registration rejected");
            }
            respond(proxy, header, RpcMessage::BbqResp { code }).await;
        }

        RpcMessage::UnregisterExc => {
            let code = match app_manager.destroy(uid).await {
                Ok(()) => RtlibExitCode::Ok,
                Err(_) => RtlibExitCode::Rejected,
            };
            respond(proxy, header, RpcMessage::BbqResp { code }).await;
        }

        RpcMessage::SetConstraint { path, bound, value } => {
            let bound_type = match bound.to_ascii_lowercase().as_str() {
                "lower" => BoundType::Lower,
                _ => BoundType::Upper,
            };
            let code = match app_manager.set_constraint(uid, &path, bound_type, value).await {
                Ok(()) => RtlibExitCode::Ok,
                Err(_) => RtlibExitCode::Rejected,
            };
            respond(proxy, header, RpcMessage::BbqResp { code }).await;
        }

        RpcMessage::ClearConstraint { path, bound } => {
            let bound_type = match bound.to_ascii_lowercase().as_str() {
                "lower" => BoundType::Lower,
                _ => BoundType::Upper,
            };
            let code = match app_manager.remove_constraint(uid, &path, bound_type).await {
                Ok(()) => RtlibExitCode::Ok,
                Err(_) => RtlibExitCode::Rejected,
            };
            respond(proxy, header, RpcMessage::BbqResp { code }).await;
        }

        RpcMessage::StartRequest | RpcMessage::ScheduleRequest => {
            let code = match app_manager.enable(uid).await {
                Ok(()) => {
                    resource_manager.notify_event(EXC_START).await;
                    RtlibExitCode::Ok
                }
                Err(_) => RtlibExitCode::Rejected,
            };
            respond(proxy, header, RpcMessage::BbqResp { code }).await;
        }

        RpcMessage::StopRequest => {
            resource_manager.request_stop(uid).await;
            respond(proxy, header, RpcMessage::BbqResp { code: RtlibExitCode::Ok }).await;
        }

        RpcMessage::GgapNotice { gap_percent } => {
            info!(%uid, gap_percent, "goal-gap notice received (advisory, no action taken)");
        }

        // RTRM→EXC and response messages never arrive as a fresh inbound
        // dispatch target: responses are matched against a waiting sync
        // phase by `SynchronizationManager::send_and_await`.
        other => {
            warn!(%uid, message = ?other, "unexpected message on the inbound dispatch path");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_manager::ApplicationManager;
    use crate::proxy::channel::InProcessChannel;
    use crate::resources::ResourceAccounter;
    use crate::scheduler::policy::RandomPolicy;
    use crate::scheduler::SchedulerManager;
    use crate::sync::policy::FifoSyncPolicy;
    use crate::sync::SynchronizationManager;
    use std::sync::Arc;

    struct EmptyLoader;
    impl crate::app::recipe::RecipeLoader for EmptyLoader {
        fn load(
            &self,
            name: &str,
            _accounter: &ResourceAccounter,
            _allow_weak: bool,
        ) -> Result<crate::app::Recipe, crate::app::RecipeError> {
            Ok(crate::app::Recipe {
                name: name.to_string(),
                awms: vec![],
                constraints: crate::app::ConstraintMap::new(),
                plugin_data: Default::default(),
                weak_load: false,
            })
        }
    }

    fn header(pid: i32, exc_id: u8, t: u8) -> RpcHeader {
        RpcHeader { token: 0, msg_type: t, app_pid: pid, exc_id }
    }

    #[tokio::test]
    async fn register_then_start_reaches_ready_and_raises_exc_start() {
        let app_manager = ApplicationManager::new();
        let accounter = Mutex::new(ResourceAccounter::new());
        let proxy = ApplicationProxy::new();
        let rm = ResourceManager::new(
            Arc::new(ApplicationManager::new()),
            ResourceAccounter::new(),
            SchedulerManager::new(Box::new(RandomPolicy)),
            SynchronizationManager::new(Box::new(FifoSyncPolicy::new())),
            Arc::new(ApplicationProxy::new()),
        );
        let (core_side, _app_side) = InProcessChannel::pair();
        proxy.pair(7, Arc::new(core_side)).await;

        dispatch_one(
            header(7, 0, 0),
            RpcMessage::RegisterExc { name: "a".into(), recipe: "r".into(), priority: 0 },
            &app_manager,
            &accounter,
            &proxy,
            &EmptyLoader,
            &rm,
        )
        .await;
        assert_eq!(app_manager.len().await, 1);

        dispatch_one(
            header(7, 0, 0),
            RpcMessage::StartRequest,
            &app_manager,
            &accounter,
            &proxy,
            &EmptyLoader,
            &rm,
        )
        .await;
        assert_eq!(
            app_manager.snapshot_state(crate::app::ExcState::Ready).await,
            vec![AppUid::new(7, 0)]
        );
    }

    #[tokio::test]
    async fn set_and_clear_constraint_round_trip() {
        let app_manager = ApplicationManager::new();
        let accounter = Mutex::new(ResourceAccounter::new());
        let proxy = ApplicationProxy::new();
        let rm = ResourceManager::new(
            Arc::new(ApplicationManager::new()),
            ResourceAccounter::new(),
            SchedulerManager::new(Box::new(RandomPolicy)),
            SynchronizationManager::new(Box::new(FifoSyncPolicy::new())),
            Arc::new(ApplicationProxy::new()),
        );
        let (core_side, _app_side) = InProcessChannel::pair();
        proxy.pair(9, Arc::new(core_side)).await;
        let uid = AppUid::new(9, 0);

        app_manager.create_exc(uid, "a", "r", 0, false, &EmptyLoader, &accounter.lock().await).await.unwrap();

        dispatch_one(
            header(9, 0, 0),
            RpcMessage::SetConstraint { path: "pe".into(), bound: "upper".into(), value: 1 },
            &app_manager,
            &accounter,
            &proxy,
            &EmptyLoader,
            &rm,
        )
        .await;
        dispatch_one(
            header(9, 0, 0),
            RpcMessage::ClearConstraint { path: "pe".into(), bound: "upper".into() },
            &app_manager,
            &accounter,
            &proxy,
            &EmptyLoader,
            &rm,
        )
        .await;
        let shared = app_manager.get(uid).await.unwrap();
        assert!(shared.lock().await.enabled_awms().is_empty());
    }
}
