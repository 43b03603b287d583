//! Restore controller
//!
//! Watches Restore resources on every node and triggers reconciliation for
//! newly observed objects. Only the node running the restore reports on it.

use std::sync::Arc;
use std::time::Duration;

use futures::{future, StreamExt, TryStreamExt};
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Controller},
        reflector, watcher,
        watcher::Config as WatcherConfig,
        WatchStreamExt,
    },
    Api, Client, ResourceExt,
};
use tracing::{error, info, instrument};

use super::events::EventFilter;
use super::{apply_decision, report_outcome, Context};
use crate::adapters::KubeLookups;
use crate::crd::Restore;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::restore as restore_reconciler;

/// Run the Restore controller
pub async fn run(client: Client, context: Arc<Context>) {
    let api: Api<Restore> = Api::all(client.clone());

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("Restore CRD not installed: {}", e);
        return;
    }

    info!(node = %context.settings.node_name, "Starting Restore controller");

    let (reader, writer) = reflector::store();
    let mut filter = EventFilter::default();
    let triggers = watcher(api, WatcherConfig::default())
        .default_backoff()
        .reflect(writer)
        .try_filter_map(move |event| future::ready(Ok(filter.admit(event))));

    Controller::for_stream(triggers, reader)
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            report_outcome("Restore", result);
        })
        .await;
}

/// Main reconciliation function
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<Restore>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&["Restore"])
        .start_timer();
    metrics::RECONCILIATIONS.with_label_values(&["Restore"]).inc();

    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let lookups = KubeLookups::new(ctx.client.clone());

    let decision = restore_reconciler::reconcile(
        &namespace,
        &name,
        &lookups,
        ctx.service.as_ref(),
        &ctx.settings,
    )
    .await?;

    let api: Api<Restore> = Api::namespaced(ctx.client.clone(), &namespace);
    apply_decision(&api, &name, decision).await
}

/// Error policy for the controller
///
/// Only transient failures reach this point; the resource status is left
/// untouched and the object is tried again.
fn error_policy(obj: Arc<Restore>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    error!(
        name = %name,
        error = %error,
        "Reconciliation failed, scheduling retry"
    );

    let requeue_duration = match error {
        Error::Kube(_) | Error::Timeout { .. } => Duration::from_secs(30),
        _ => Duration::from_secs(60),
    };

    Action::requeue(requeue_duration)
}
