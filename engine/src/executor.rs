use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use veld_diff::{DeleteStep, DiffAction, Plan, PlannedResource, ReplaceOrder};
use veld_graph::Input;
use veld_output::{OutputResolver, Resolution, ResolvedOutputs, Slot};
use veld_provider::{Inputs, Outputs, ProviderClient, ProviderError};
use veld_resource::ResourceId;
use veld_state::{digest, StateSnapshot, StateStore};

use crate::report::{ApplyReport, ResourceStatus, StatusTable};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Maximum in-flight provider operations.
    pub parallelism: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            parallelism: 10,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("executor task panicked")]
    Task(#[from] tokio::task::JoinError),
}

/// Drives a plan against the provider.
///
/// Apply waves are dispatched in order without waiting for the
/// previous wave to complete; each resource additionally blocks on its
/// own dependencies' resolution slots, so cross-wave ordering is
/// enforced at the output level. Delete waves run after all applies,
/// one wave at a time.
pub struct Engine {
    provider: Arc<dyn ProviderClient>,
    options: EngineOptions,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        options: EngineOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            options,
            cancel,
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn apply(
        &self,
        plan: Plan,
        snapshot: StateSnapshot,
        store: Arc<Mutex<StateStore>>,
    ) -> Result<ApplyReport, EngineError> {
        let statuses = StatusTable::default();
        for step in plan.resources() {
            statuses.seed(&step.id);
        }
        for delete in plan.deletes.iter().flatten() {
            statuses.seed(&delete.id);
        }

        let ctx = StepContext {
            provider: self.provider.clone(),
            resolver: OutputResolver::new(),
            snapshot: Arc::new(snapshot),
            store,
            statuses: statuses.clone(),
            semaphore: Arc::new(Semaphore::new(self.options.parallelism)),
            retry: self.options.retry.clone(),
            cancel: self.cancel.clone(),
        };

        let mut handles = Vec::new();
        for (index, wave) in plan.waves.into_iter().enumerate() {
            debug!(wave = index, count = wave.len(), "dispatching wave");
            for step in wave {
                if ctx.cancel.is_cancelled() {
                    skip(&step.id, &ctx);
                    continue;
                }
                let ctx = ctx.clone();
                handles.push(tokio::spawn(async move { run_step(step, ctx).await }));
            }
        }
        for result in join_all(handles).await {
            result?;
        }

        for (index, wave) in plan.deletes.into_iter().enumerate() {
            debug!(wave = index, count = wave.len(), "dispatching delete wave");
            let mut handles = Vec::new();
            for delete in wave {
                if ctx.cancel.is_cancelled() {
                    ctx.statuses.set(&delete.id, ResourceStatus::Skipped);
                    continue;
                }
                let ctx = ctx.clone();
                handles.push(tokio::spawn(async move { run_delete(delete, ctx).await }));
            }
            for result in join_all(handles).await {
                result?;
            }
        }

        Ok(statuses.into_report())
    }
}

#[derive(Clone)]
struct StepContext {
    provider: Arc<dyn ProviderClient>,
    resolver: OutputResolver,
    snapshot: Arc<StateSnapshot>,
    store: Arc<Mutex<StateStore>>,
    statuses: StatusTable,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

async fn run_step(step: PlannedResource, ctx: StepContext) {
    ctx.statuses.set(&step.id, ResourceStatus::Waiting);

    for dep in &step.dependencies {
        if let Slot::Failed = ctx.resolver.wait(dep).await {
            debug!(resource = %step.id, dependency = %dep, "dependency failed, skipping");
            skip(&step.id, &ctx);
            return;
        }
    }

    if step.action.is_noop() {
        let mut outputs = ResolvedOutputs::default();
        if let Some(record) = ctx.snapshot.record(&step.id) {
            for (property, (value, secret)) in &record.outputs {
                outputs.values.insert(property.clone(), value.clone());
                if *secret {
                    outputs.secret_props.insert(property.clone());
                }
            }
        }
        ctx.resolver.resolve(&step.id, outputs);

        // A superseded instance an earlier replacement failed to
        // delete is retried even when the resource itself is a no-op.
        if let Some(orphan) = &step.pending_delete {
            if !ctx.cancel.is_cancelled() {
                ctx.statuses.set(&step.id, ResourceStatus::Executing);
                let _permit = ctx.semaphore.clone().acquire_owned().await.ok();
                if let Err(error) = delete_orphan(&step.id, orphan, &ctx).await {
                    ctx.statuses.set(&step.id, ResourceStatus::Failed { error });
                    return;
                }
            }
        }
        ctx.statuses.set(&step.id, ResourceStatus::Succeeded);
        return;
    }

    let mut values = Inputs::new();
    let mut secret_props: BTreeSet<String> = BTreeSet::new();
    for (property, input) in &step.definition.inputs {
        let resolution = match input {
            Input::Value { value, secret } => Resolution::Resolved {
                value: value.clone(),
                secret: *secret,
            },
            Input::Output(output) => output.resolve(&ctx.resolver).await,
        };
        match resolution {
            Resolution::Resolved { value, secret } => {
                if secret {
                    secret_props.insert(property.clone());
                }
                values.insert(property.clone(), value);
            }
            Resolution::Unknown => {
                fail(
                    &step.id,
                    &ctx,
                    format!("input \"{property}\" did not resolve to a value"),
                );
                return;
            }
            Resolution::Failed(upstream) => {
                debug!(resource = %step.id, dependency = %upstream, "input failed, skipping");
                skip(&step.id, &ctx);
                return;
            }
        }
    }

    // Cancellation stops new dispatch; in-flight calls below are
    // allowed to finish so state is never ambiguous.
    if ctx.cancel.is_cancelled() {
        skip(&step.id, &ctx);
        return;
    }

    ctx.statuses.set(&step.id, ResourceStatus::Executing);
    let _permit = match ctx.semaphore.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            skip(&step.id, &ctx);
            return;
        }
    };

    // A leftover superseded instance dies before anything else touches
    // this resource, keeping at most one pending delete per record.
    if let Some(orphan) = &step.pending_delete {
        if let Err(error) = delete_orphan(&step.id, orphan, &ctx).await {
            fail(&step.id, &ctx, error);
            return;
        }
    }

    match &step.action {
        DiffAction::Replace { order, .. } => {
            apply_replace(&step, *order, values, secret_props, &ctx).await;
        }
        _ => match perform(&step, &values, &ctx).await {
            Ok((outputs, provider_id)) => {
                if persist_applied(&step, values, secret_props, outputs, provider_id, None, &ctx)
                    .await
                {
                    info!(resource = %step.id, action = step.action.symbol(), "applied");
                    ctx.statuses.set(&step.id, ResourceStatus::Succeeded);
                }
            }
            Err(err) => fail(&step.id, &ctx, err.to_string()),
        },
    }
}

/// Resolve outputs and persist the record. On a write failure, marks
/// the resource failed and returns false; setting the success status
/// is left to the caller.
async fn persist_applied(
    step: &PlannedResource,
    values: Inputs,
    secret_props: BTreeSet<String>,
    outputs: Outputs,
    provider_id: String,
    pending_delete: Option<String>,
    ctx: &StepContext,
) -> bool {
    let resolved = ResolvedOutputs {
        values: outputs.clone(),
        secret_props: outputs
            .keys()
            .filter(|property| secret_props.contains(*property))
            .cloned()
            .collect(),
        all_secret: false,
    };
    ctx.resolver.resolve(&step.id, resolved);

    let input_digests = values
        .iter()
        .map(|(property, value)| (property.clone(), digest(value)))
        .collect();
    let stored_outputs = outputs
        .into_iter()
        .map(|(property, value)| {
            let secret = secret_props.contains(&property);
            (property, (value, secret))
        })
        .collect();

    let written = ctx
        .store
        .lock()
        .await
        .record_applied(
            &step.id,
            provider_id,
            input_digests,
            stored_outputs,
            step.dependencies.clone(),
            pending_delete,
        )
        .await;
    match written {
        Ok(()) => true,
        Err(err) => {
            error!(resource = %step.id, "state write failed: {err}");
            ctx.statuses.set(
                &step.id,
                ResourceStatus::Failed {
                    error: err.to_string(),
                },
            );
            false
        }
    }
}

/// Run the two halves of a replacement, persisting progress between
/// them so an interrupted run leaves state pointing at live instances.
async fn apply_replace(
    step: &PlannedResource,
    order: ReplaceOrder,
    values: Inputs,
    secret_props: BTreeSet<String>,
    ctx: &StepContext,
) {
    let ty = &step.id.ty;
    let old = match existing_id(step) {
        Ok(old) => old,
        Err(err) => {
            fail(&step.id, ctx, err.to_string());
            return;
        }
    };

    match order {
        ReplaceOrder::CreateBeforeDelete => {
            let created =
                with_retry(&ctx.retry, &ctx.cancel, || ctx.provider.create(ty, &values)).await;
            let (outputs, new_id) = match created {
                Ok(created) => created,
                Err(err) => {
                    fail(&step.id, ctx, err.to_string());
                    return;
                }
            };
            // The new instance goes on record before the old one is
            // touched; a failed delete leaves it pending for the next
            // run instead of leaking it.
            if !persist_applied(
                step,
                values,
                secret_props,
                outputs,
                new_id,
                Some(old.clone()),
                ctx,
            )
            .await
            {
                return;
            }
            if let Err(error) = delete_orphan(&step.id, &old, ctx).await {
                // Outputs already resolved for dependents; only this
                // resource's status carries the leftover.
                error!(resource = %step.id, "replacement cleanup failed: {error}");
                ctx.statuses.set(&step.id, ResourceStatus::Failed { error });
                return;
            }
            info!(resource = %step.id, action = step.action.symbol(), "applied");
            ctx.statuses.set(&step.id, ResourceStatus::Succeeded);
        }
        ReplaceOrder::DeleteBeforeCreate => {
            if let Err(err) =
                with_retry(&ctx.retry, &ctx.cancel, || ctx.provider.delete(ty, &old)).await
            {
                fail(&step.id, ctx, err.to_string());
                return;
            }
            // The old instance is gone; dropping its record makes a
            // failed create replan as a plain create next run.
            if let Err(err) = ctx.store.lock().await.remove(&step.id).await {
                fail(&step.id, ctx, err.to_string());
                return;
            }
            match with_retry(&ctx.retry, &ctx.cancel, || ctx.provider.create(ty, &values)).await {
                Ok((outputs, new_id)) => {
                    if persist_applied(step, values, secret_props, outputs, new_id, None, ctx)
                        .await
                    {
                        info!(resource = %step.id, action = step.action.symbol(), "applied");
                        ctx.statuses.set(&step.id, ResourceStatus::Succeeded);
                    }
                }
                Err(err) => fail(&step.id, ctx, err.to_string()),
            }
        }
    }
}

/// Delete a superseded instance left over from a replacement and clear
/// it from the record.
async fn delete_orphan(id: &ResourceId, orphan: &str, ctx: &StepContext) -> Result<(), String> {
    with_retry(&ctx.retry, &ctx.cancel, || {
        ctx.provider.delete(&id.ty, orphan)
    })
    .await
    .map_err(|err| err.to_string())?;
    ctx.store
        .lock()
        .await
        .clear_pending_delete(id)
        .await
        .map_err(|err| err.to_string())?;
    info!(resource = %id, orphan, "deleted superseded instance");
    Ok(())
}

async fn perform(
    step: &PlannedResource,
    values: &Inputs,
    ctx: &StepContext,
) -> Result<(Outputs, String), ProviderError> {
    let ty = &step.id.ty;
    match &step.action {
        DiffAction::Create => {
            with_retry(&ctx.retry, &ctx.cancel, || ctx.provider.create(ty, values)).await
        }
        DiffAction::Update { .. } => {
            let id = existing_id(step)?;
            let outputs = with_retry(&ctx.retry, &ctx.cancel, || {
                ctx.provider.update(ty, &id, values)
            })
            .await?;
            Ok((outputs, id))
        }
        DiffAction::Replace { .. } | DiffAction::NoOp => Err(ProviderError::Permanent(
            "replace and no-op resources take their own paths".to_string(),
        )),
    }
}

async fn run_delete(delete: DeleteStep, ctx: StepContext) {
    ctx.statuses.set(&delete.id, ResourceStatus::Executing);
    let _permit = match ctx.semaphore.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            ctx.statuses.set(&delete.id, ResourceStatus::Skipped);
            return;
        }
    };

    // Any superseded instance dies along with the current one.
    if let Some(orphan) = &delete.pending_delete {
        if let Err(error) = delete_orphan(&delete.id, orphan, &ctx).await {
            ctx.statuses.set(&delete.id, ResourceStatus::Failed { error });
            return;
        }
    }

    let deleted = with_retry(&ctx.retry, &ctx.cancel, || {
        ctx.provider.delete(&delete.ty, &delete.provider_id)
    })
    .await;
    match deleted {
        Ok(()) => match ctx.store.lock().await.remove(&delete.id).await {
            Ok(()) => {
                info!(resource = %delete.id, "deleted");
                ctx.statuses.set(&delete.id, ResourceStatus::Succeeded);
            }
            Err(err) => {
                error!(resource = %delete.id, "state write failed: {err}");
                ctx.statuses.set(
                    &delete.id,
                    ResourceStatus::Failed {
                        error: err.to_string(),
                    },
                );
            }
        },
        Err(err) => {
            ctx.statuses.set(
                &delete.id,
                ResourceStatus::Failed {
                    error: err.to_string(),
                },
            );
        }
    }
}

fn existing_id(step: &PlannedResource) -> Result<String, ProviderError> {
    step.provider_id
        .clone()
        .ok_or_else(|| ProviderError::Permanent("no provider id recorded in state".to_string()))
}

async fn with_retry<T, F, Fut>(
    retry: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err)
                if err.is_transient()
                    && attempt < retry.max_attempts
                    && !cancel.is_cancelled() =>
            {
                warn!(attempt, "transient provider error, backing off: {err}");
                tokio::time::sleep(retry.delay_before(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn skip(id: &ResourceId, ctx: &StepContext) {
    ctx.statuses.set(id, ResourceStatus::Skipped);
    ctx.resolver.fail(id);
}

fn fail(id: &ResourceId, ctx: &StepContext, error: String) {
    error!(resource = %id, "apply failed: {error}");
    ctx.statuses.set(id, ResourceStatus::Failed { error });
    ctx.resolver.fail(id);
}
