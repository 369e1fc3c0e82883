use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::events::Recorder;
use kube::{
    api::{Api, ListParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType},
        watcher::Config,
    },
    Resource,
};
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

use crate::controllers::{Diagnostics, State};
use crate::registry::{ImageReference, RegistryClient};
use crate::resources::sonarrs::{Sonarr, SonarrPhase, SonarrStatus};
use crate::store::{KubeStore, ObjectStore};
use crate::{telemetry, Error, Metrics, Result};

use super::reconcilers::defaults::{apply_defaults, DefaultedField, DEFAULT_IMAGE};
use super::reconcilers::deployment::{desired_deployment, reconcile_deployment, FieldGroup};
use super::reconcilers::image::resolve_image;
use super::reconcilers::service::desired_service;
use super::reconcilers::status::{deployment_conditions, derive_phase, empty_conditions};
use super::reconcilers::APP_NAME;

/// How long to wait between passes when `watchFrequency` can't be parsed
pub const FALLBACK_WATCH_INTERVAL: Duration = Duration::from_secs(60);

/// Prefix of `status.reason` while the last reconcile failed
pub const FAILURE_REASON_PREFIX: &str = "Reconcile failed: ";

/// A single persisted change made by a reconcile pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    SpecDefaulted(DefaultedField),
    ImageResolved(String),
    DeploymentCreated,
    DeploymentCorrected(FieldGroup),
    ServiceCreated,
}

impl Step {
    fn reason(&self) -> &'static str {
        match self {
            Step::SpecDefaulted(_) => "SpecDefaulted",
            Step::ImageResolved(_) => "ImageResolved",
            Step::DeploymentCreated => "DeploymentCreated",
            Step::DeploymentCorrected(_) => "DeploymentCorrected",
            Step::ServiceCreated => "ServiceCreated",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::SpecDefaulted(field) => write!(f, "Set default because {field}"),
            Step::ImageResolved(image) => write!(f, "Resolved image to {image}"),
            Step::DeploymentCreated => f.write_str("Created deployment"),
            Step::DeploymentCorrected(group) => write!(f, "Corrected deployment: {group}"),
            Step::ServiceCreated => f.write_str("Created service"),
        }
    }
}

/// What the caller should do after a reconcile pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The Sonarr no longer exists; nothing to do until it changes
    Deleted,
    /// A change was persisted; run again straight away to observe it
    Requeue(Step),
    /// Everything is in sync; check again after the watch frequency
    RequeueAfter(Duration),
}

impl From<ReconcileOutcome> for Action {
    fn from(outcome: ReconcileOutcome) -> Self {
        match outcome {
            ReconcileOutcome::Deleted => Action::await_change(),
            ReconcileOutcome::Requeue(_) => Action::requeue(Duration::ZERO),
            ReconcileOutcome::RequeueAfter(after) => Action::requeue(after),
        }
    }
}

/// Run one reconcile pass for the Sonarr `namespace/name`.
///
/// Every branch that persists a change returns [`ReconcileOutcome::Requeue`]
/// straight away, so each change is observed before the next decision is made.
pub async fn reconcile_sonarr(
    store: &dyn ObjectStore,
    registry: &dyn RegistryClient,
    namespace: &str,
    name: &str,
) -> Result<ReconcileOutcome> {
    let Some(mut sonarr) = store.get_sonarr(namespace, name).await? else {
        debug!("Sonarr {namespace}/{name} is gone");
        return Ok(ReconcileOutcome::Deleted);
    };

    if let Some(field) = apply_defaults(&mut sonarr.spec) {
        info!("Defaulting Sonarr {namespace}/{name}: {field}");
        let mut sonarr = store.update_sonarr(&sonarr).await?;
        let status = SonarrStatus {
            phase: Some(SonarrPhase::Initializing),
            reason: Some("Setting default spec settings".into()),
            deployments: empty_conditions(),
            ..current_status(&sonarr)
        };
        write_status(store, &mut sonarr, status).await?;
        return Ok(ReconcileOutcome::Requeue(Step::SpecDefaulted(field)));
    }

    let spec_image = sonarr.spec.image().unwrap_or(DEFAULT_IMAGE).to_owned();
    let resolved = match resolve(registry, &sonarr, &spec_image).await {
        Ok(resolved) => resolved,
        Err(err) => {
            record_failure(store, &mut sonarr, &err).await;
            return Err(err);
        }
    };

    let mut status = current_status(&sonarr);
    if status.reason.as_deref().is_some_and(is_failure_reason) {
        status.reason = None;
    }
    if status.image.as_deref() != Some(resolved.as_str())
        || status.source_image.as_deref() != Some(spec_image.as_str())
    {
        info!("Sonarr {namespace}/{name} now runs {resolved}");
        let status = SonarrStatus {
            image: Some(resolved.clone()),
            source_image: Some(spec_image),
            ..status
        };
        write_status(store, &mut sonarr, status).await?;
        return Ok(ReconcileOutcome::Requeue(Step::ImageResolved(resolved)));
    }

    let desired = match desired_deployment(&sonarr, &resolved) {
        Ok(desired) => desired,
        Err(err) => {
            record_failure(store, &mut sonarr, &err).await;
            return Err(err);
        }
    };
    // a previous failure no longer applies once the image resolves and the deployment builds
    write_status(store, &mut sonarr, status).await?;

    let Some(mut observed) = store.get_deployment(namespace, name).await? else {
        info!("Creating deployment for Sonarr {namespace}/{name}");
        store.create_deployment(&desired).await?;
        let status = SonarrStatus {
            phase: Some(SonarrPhase::Initializing),
            reason: Some("Created deployment".into()),
            ..current_status(&sonarr)
        };
        write_status(store, &mut sonarr, status).await?;
        return Ok(ReconcileOutcome::Requeue(Step::DeploymentCreated));
    };

    let mut status = current_status(&sonarr);
    status.deployments = deployment_conditions(&observed);
    write_status(store, &mut sonarr, status.clone()).await?;

    if let Some(group) = reconcile_deployment(&mut observed, &desired) {
        warn!("Deployment {namespace}/{name} drifted: {group}");
        store.update_deployment(&observed).await?;
        status.phase = Some(SonarrPhase::Updating);
        status.reason = Some(format!("Updating deployment: {group}"));
        write_status(store, &mut sonarr, status).await?;
        return Ok(ReconcileOutcome::Requeue(Step::DeploymentCorrected(group)));
    }

    if store.get_service(namespace, name).await?.is_none() {
        info!("Creating service for Sonarr {namespace}/{name}");
        store.create_service(&desired_service(&sonarr)?).await?;
        status.phase = Some(SonarrPhase::Initializing);
        status.reason = Some("Created service".into());
        write_status(store, &mut sonarr, status).await?;
        return Ok(ReconcileOutcome::Requeue(Step::ServiceCreated));
    }

    derive_phase(&mut status);
    write_status(store, &mut sonarr, status).await?;

    Ok(ReconcileOutcome::RequeueAfter(watch_interval(
        sonarr.spec.watch_frequency(),
    )))
}

async fn resolve(
    registry: &dyn RegistryClient,
    sonarr: &Sonarr,
    spec_image: &str,
) -> Result<String> {
    let image = ImageReference::parse(spec_image)?;
    let status = sonarr.status.as_ref();

    // a resolution only counts if it was made from the image currently in the spec
    let current = status
        .filter(|s| s.source_image.as_deref() == Some(spec_image))
        .and_then(|s| s.image.as_deref());

    Ok(resolve_image(registry, &image, current, sonarr.spec.disable_updates).await?)
}

fn current_status(sonarr: &Sonarr) -> SonarrStatus {
    sonarr.status.clone().unwrap_or_default()
}

/// Persist `status` unless it matches what is already stored
async fn write_status(
    store: &dyn ObjectStore,
    sonarr: &mut Sonarr,
    status: SonarrStatus,
) -> Result<()> {
    if current_status(sonarr) == status {
        return Ok(());
    }
    sonarr.status = Some(status);
    *sonarr = store.update_sonarr_status(sonarr).await?;
    Ok(())
}

// best effort; the original error is what gets reported
async fn record_failure(store: &dyn ObjectStore, sonarr: &mut Sonarr, err: &Error) {
    let status = SonarrStatus {
        reason: Some(format!("{FAILURE_REASON_PREFIX}{err}")),
        ..current_status(sonarr)
    };
    if let Err(err) = write_status(store, sonarr, status).await {
        warn!("Failed to record failure on Sonarr {}: {err}", sonarr.name_any());
    }
}

fn is_failure_reason(reason: &str) -> bool {
    reason.starts_with(FAILURE_REASON_PREFIX)
}

// calendar units have no fixed length
const CALENDAR_UNITS: [&str; 12] = [
    "d", "day", "days", "w", "week", "weeks", "M", "month", "months", "y", "year", "years",
];

/// Parse a watch frequency like `90s` or `1h 30m`, falling back to one minute
///
/// Zero and calendar units (days and longer) are rejected.
pub fn watch_interval(watch_frequency: Option<&str>) -> Duration {
    let Some(watch_frequency) = watch_frequency else {
        return FALLBACK_WATCH_INTERVAL;
    };
    let calendar_unit = watch_frequency
        .split(|c: char| !c.is_alphabetic())
        .find(|unit| CALENDAR_UNITS.contains(unit));
    if let Some(unit) = calendar_unit {
        warn!("Invalid watch frequency {watch_frequency:?}: unsupported unit {unit:?}");
        return FALLBACK_WATCH_INTERVAL;
    }
    match humantime::parse_duration(watch_frequency) {
        Ok(interval) if interval.is_zero() => {
            warn!("Invalid watch frequency {watch_frequency:?}: must be positive");
            FALLBACK_WATCH_INTERVAL
        }
        Ok(interval) => interval,
        Err(err) => {
            warn!("Invalid watch frequency {watch_frequency:?}: {err}");
            FALLBACK_WATCH_INTERVAL
        }
    }
}

// Context for our reconciler
#[derive(Clone)]
struct Context {
    /// Cluster API access
    store: Arc<dyn ObjectStore>,
    /// Registry used to pin image tags
    registry: Arc<dyn RegistryClient>,
    /// Kubernetes event recorder
    recorder: Recorder,
    /// Diagnostics read by the web server
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    metrics: Metrics,
}

impl Context {
    fn new(
        client: Client,
        registry: Arc<dyn RegistryClient>,
        metrics: Metrics,
        state: &State,
    ) -> Arc<Context> {
        Arc::new(Context {
            store: Arc::new(KubeStore::new(client.clone())),
            registry,
            recorder: Recorder::new(client, "sonarr-operator".into()),
            diagnostics: state.diagnostics.clone(),
            metrics,
        })
    }

    async fn publish(&self, sonarr: &Sonarr, type_: EventType, reason: &str, note: String) {
        let event = Event {
            type_,
            reason: reason.into(),
            note: Some(note),
            action: "Reconcile".into(),
            secondary: None,
        };
        if let Err(err) = self.recorder.publish(&event, &sonarr.object_ref(&())).await {
            warn!("Failed to publish event for Sonarr {}: {err}", sonarr.name_any());
        }
    }
}

#[instrument(skip(ctx, sonarr), fields(trace_id))]
async fn reconcile(sonarr: Arc<Sonarr>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<Sonarr>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let result = match object_key(&sonarr) {
        Ok((namespace, name)) => {
            info!("Reconciling Sonarr \"{name}\" in {namespace}");
            reconcile_sonarr(
                ctx.store.as_ref(),
                ctx.registry.as_ref(),
                &namespace,
                &name,
            )
            .await
        }
        Err(err) => Err(err),
    };
    match result {
        Ok(outcome) => {
            if let ReconcileOutcome::Requeue(step) = &outcome {
                if let Step::DeploymentCorrected(group) = step {
                    ctx.metrics.drift_corrected(group.label());
                }
                ctx.publish(&sonarr, EventType::Normal, step.reason(), step.to_string())
                    .await;
            }
            Ok(outcome.into())
        }
        Err(err) => {
            warn!("reconcile failed: {:?}", err);
            ctx.publish(&sonarr, EventType::Warning, "FailedReconcile", err.to_string())
                .await;
            ctx.metrics.reconcile_failure(sonarr.as_ref(), &err);
            Err(err)
        }
    }
}

fn object_key(sonarr: &Sonarr) -> Result<(String, String)> {
    let namespace = sonarr
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    Ok((namespace, sonarr.name_any()))
}

fn error_policy(_sonarr: Arc<Sonarr>, error: &Error, _ctx: Arc<Context>) -> Action {
    Action::requeue(error.requeue_after())
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(
    client: Client,
    metrics: Metrics,
    state: State,
    watch_namespace: Option<String>,
    registry: Arc<dyn RegistryClient>,
) {
    let (sonarr_api, dep_api, svc_api) = match watch_namespace.as_deref() {
        Some(ns) => (
            Api::<Sonarr>::namespaced(client.clone(), ns),
            Api::<Deployment>::namespaced(client.clone(), ns),
            Api::<Service>::namespaced(client.clone(), ns),
        ),
        None => (
            Api::<Sonarr>::all(client.clone()),
            Api::<Deployment>::all(client.clone()),
            Api::<Service>::all(client.clone()),
        ),
    };

    if let Err(e) = sonarr_api.list(&ListParams::default().limit(1)).await {
        error!("Sonarr is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    // all resources we create have this label
    let cfg = Config::default().labels(&format!("app.kubernetes.io/name={APP_NAME}"));

    Controller::new(sonarr_api, Config::default())
        .shutdown_on_signal()
        .owns(dep_api, cfg.clone())
        .owns(svc_api, cfg)
        .run(
            reconcile,
            error_policy,
            Context::new(client, registry, metrics, &state),
        )
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
