use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cartograph_agent::AgentRuntime;
use cartograph_cache::{Cache, CacheLookup};
use cartograph_core::ProgressBus;
use cartograph_gateway::{CompletionRequest, Message, ProviderGateway};
use cartograph_store::Store;
use cartograph_types::{CoreError, CoreResult, MessageRole, Priority, ProgressEvent, Scope, Target};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::external::CodeGraph;

#[derive(Clone)]
pub struct Semaphores {
    pub subsystems: Arc<Semaphore>,
    pub modules: Arc<Semaphore>,
    pub functions: Arc<Semaphore>,
}

impl Semaphores {
    pub fn new(subsystems: usize, modules: usize, functions: usize) -> Self {
        Self {
            subsystems: Arc::new(Semaphore::new(subsystems.max(1))),
            modules: Arc::new(Semaphore::new(modules.max(1))),
            functions: Arc::new(Semaphore::new(functions.max(1))),
        }
    }
}

#[derive(Default)]
pub struct ProgressCounters {
    pub modules_done: AtomicU64,
    pub modules_total: AtomicU64,
    pub functions_done: AtomicU64,
    pub functions_total: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
}

/// Everything shared, read-only or internally-synchronized, across one tree
/// walk. Held behind an `Arc` so spawned subsystem/module tasks can outlive
/// the stack frame that created them.
pub struct WalkContext {
    pub store: Arc<Store>,
    pub cache: Arc<Cache>,
    pub gateway: Arc<ProviderGateway>,
    pub progress: ProgressBus,
    pub graph: Arc<dyn CodeGraph>,
    pub semaphores: Semaphores,
    pub counters: ProgressCounters,
    pub session_id: Uuid,
    pub cancel: CancellationToken,
    pub provider_kind: Option<String>,
}

/// What a finished activation hands its parent for synthesis: the findings
/// it produced and whether it ended in `Error`. A failed child still
/// contributes nothing further, but does not stop its siblings or its
/// parent's own synthesis.
pub struct AgentOutcome {
    pub agent_id: String,
    pub card_ids: Vec<String>,
    pub findings: Vec<String>,
    pub errored: bool,
    pub errors: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct LeafFinding {
    title: String,
    summary: String,
    priority_rank: u8,
}

fn priority_from_rank(rank: u8) -> Priority {
    match rank {
        0 => Priority::P0,
        1 => Priority::P1,
        2 => Priority::P2,
        _ => Priority::P3,
    }
}

/// Splits `paths` at directory depth `depth`: paths with no further segment
/// are owned directly by this node, the rest are grouped by their next
/// path component into nested subsystems.
fn group_by_prefix(paths: &[String], depth: usize) -> (Vec<String>, BTreeMap<String, Vec<String>>) {
    let mut direct = Vec::new();
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for path in paths {
        let segments: Vec<&str> = path.split('/').collect();
        if segments.len() > depth + 1 {
            groups.entry(segments[depth].to_string()).or_default().push(path.clone());
        } else {
            direct.push(path.clone());
        }
    }
    (direct, groups)
}

fn estimate_tokens(text: &str) -> u64 {
    (text.len() / 4).max(1) as u64
}

async fn acquire_or_cancelled(sem: &Arc<Semaphore>, cancel: &CancellationToken) -> CoreResult<tokio::sync::OwnedSemaphorePermit> {
    tokio::select! {
        permit = sem.clone().acquire_owned() => permit.map_err(|_| CoreError::Cancelled),
        _ = cancel.cancelled() => Err(CoreError::Cancelled),
    }
}

/// Runs a completed set of children through one synthesis call and returns
/// the parent-scope card it produces. `card_type` follows §4.9 step 8:
/// Architecture at System, Review elsewhere. `always_emit` forces a card
/// even with no child findings — required at System scope so a zero-file
/// run still produces its Architecture card noting an empty scope.
async fn synthesize(
    ctx: &WalkContext,
    runtime: &mut AgentRuntime,
    scope: Scope,
    target: &Target,
    children: &[AgentOutcome],
    card_type: cartograph_types::CardType,
    always_emit: bool,
) -> CoreResult<Option<String>> {
    let mut findings: Vec<String> = children.iter().flat_map(|c| c.findings.clone()).collect();
    findings.sort();
    findings.dedup();
    if findings.is_empty() {
        if !always_emit {
            return Ok(None);
        }
        let card = ctx.store.create_card(
            "CARTO",
            card_type,
            runtime.id(),
            format!("{:?} synthesis for {}", scope, target.path),
            format!("{:?} scope at {} has no child findings to synthesize.", scope, target.path),
        )?;
        runtime.add_finding("empty scope, no child findings".to_string(), Some(card.id.clone()));
        return Ok(Some(card.id));
    }

    let prompt = format!(
        "Synthesize a {:?}-scope summary for {} from these child findings:\n{}",
        scope,
        target.path,
        findings.join("\n")
    );
    let estimated = estimate_tokens(&prompt);
    let request = CompletionRequest {
        model_id: "synthesis".to_string(),
        messages: vec![
            Message::System { content: "You synthesize child analysis findings into one parent summary.".to_string() },
            Message::User { content: prompt },
        ],
        max_tokens: 1024,
        tool_definitions: None,
        estimated_tokens: estimated,
    };

    let started = std::time::Instant::now();
    let response = ctx.gateway.complete(ctx.provider_kind.as_deref(), request).await?;
    let latency_ms = started.elapsed().as_millis() as u64;
    runtime.record_message(
        MessageRole::Assistant,
        response.content.clone(),
        response.input_tokens,
        response.output_tokens,
        vec![],
        latency_ms,
    );

    let card = ctx.store.create_card(
        "CARTO",
        card_type,
        runtime.id(),
        format!("{:?} synthesis for {}", scope, target.path),
        response.content,
    )?;
    runtime.add_finding(format!("synthesized {} child findings", findings.len()), Some(card.id.clone()));
    Ok(Some(card.id))
}

/// §4.9 step 7: a leaf Function activation. Checks the cache, falls back to
/// the provider on a miss, and always creates exactly one card.
pub async fn run_function(
    ctx: Arc<WalkContext>,
    parent_agent_id: String,
    module_path: String,
    function: crate::external::FunctionDescriptor,
) -> AgentOutcome {
    let target = Target::with_qualifier(module_path.clone(), function.qualifier.clone());
    let mut runtime = match AgentRuntime::begin(
        ctx.store.clone(),
        Some(parent_agent_id.clone()),
        Scope::Function,
        target.clone(),
        ctx.session_id,
    )
    .await
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(%err, function = %function.qualifier, "failed to begin function agent");
            return AgentOutcome {
                agent_id: String::new(),
                card_ids: vec![],
                findings: vec![],
                errored: true,
                errors: vec![format!("failed to begin function agent for {}: {err}", function.qualifier)],
            };
        }
    };
    let agent_id = runtime.id().to_string();

    let path = std::path::Path::new(&module_path);
    let lookup = ctx.cache.lookup(path, Scope::Function, &function.qualifier);

    let finding: CoreResult<LeafFinding> = match lookup {
        Ok(CacheLookup::Hit(payload)) => {
            ctx.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            serde_json::from_str(&payload).map_err(CoreError::from)
        }
        Ok(CacheLookup::Miss) | Err(_) => {
            ctx.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
            run_function_via_provider(&ctx, &mut runtime, &module_path, &function).await
        }
    };

    let outcome = match finding {
        Ok(finding) => {
            let card_result = ctx.store.create_card(
                "CARTO",
                cartograph_types::CardType::Review,
                &agent_id,
                finding.title.clone(),
                finding.summary.clone(),
            );
            match card_result {
                Ok(card) => {
                    if let Err(err) = ctx.store.update_card(
                        &card.id,
                        cartograph_store::CardPatch {
                            priority: Some(priority_from_rank(finding.priority_rank)),
                            ..Default::default()
                        },
                        &agent_id,
                    ) {
                        tracing::warn!(%err, card_id = %card.id, "failed to set leaf card priority");
                    }
                    runtime.add_finding(finding.summary.clone(), Some(card.id.clone()));
                    let snapshot = runtime.complete("function analyzed").await;
                    match snapshot {
                        Ok(_) => AgentOutcome {
                            agent_id: agent_id.clone(),
                            card_ids: vec![card.id],
                            findings: vec![finding.summary],
                            errored: false,
                            errors: vec![],
                        },
                        Err(err) => {
                            tracing::error!(%err, agent_id = %agent_id, "failed to complete function agent");
                            AgentOutcome {
                                agent_id: agent_id.clone(),
                                card_ids: vec![card.id],
                                findings: vec![],
                                errored: true,
                                errors: vec![format!("failed to complete function agent {agent_id}: {err}")],
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(%err, function = %function.qualifier, "store failure creating leaf card");
                    let failed_err = runtime.fail(err).await;
                    AgentOutcome {
                        agent_id: agent_id.clone(),
                        card_ids: vec![],
                        findings: vec![format!("store error: {failed_err}")],
                        errored: true,
                        errors: vec![format!("function {} store error: {failed_err}", function.qualifier)],
                    }
                }
            }
        }
        Err(err) => {
            let retryable = err.retryable();
            tracing::warn!(%err, function = %function.qualifier, retryable, "function activation failed");
            let failed_err = runtime.fail(err).await;
            AgentOutcome {
                agent_id: agent_id.clone(),
                card_ids: vec![],
                findings: vec![format!("analysis failed: {failed_err}")],
                errored: true,
                errors: vec![format!("function {} failed: {failed_err}", function.qualifier)],
            }
        }
    };

    ctx.counters.functions_done.fetch_add(1, Ordering::Relaxed);
    publish_progress(&ctx);
    outcome
}

async fn run_function_via_provider(
    ctx: &WalkContext,
    runtime: &mut AgentRuntime,
    module_path: &str,
    function: &crate::external::FunctionDescriptor,
) -> CoreResult<LeafFinding> {
    let callers = ctx.graph.callers(&function.qualifier);
    let callees = ctx.graph.callees(&function.qualifier);
    let prompt = format!(
        "Review this function.\nPath: {module_path}\nSignature: {}\nDocstring: {}\nCallers: {}\nCallees: {}\nSource:\n{}",
        function.signature,
        function.docstring.as_deref().unwrap_or("(none)"),
        callers.join(", "),
        callees.join(", "),
        function.source,
    );
    let estimated = estimate_tokens(&prompt);
    let request = CompletionRequest {
        model_id: "review".to_string(),
        messages: vec![
            Message::System { content: "You review one function and report findings as JSON.".to_string() },
            Message::User { content: prompt },
        ],
        max_tokens: 512,
        tool_definitions: None,
        estimated_tokens: estimated,
    };

    let started = std::time::Instant::now();
    let response = ctx.gateway.complete(ctx.provider_kind.as_deref(), request).await?;
    let latency_ms = started.elapsed().as_millis() as u64;
    runtime.record_message(
        MessageRole::Assistant,
        response.content.clone(),
        response.input_tokens,
        response.output_tokens,
        vec![],
        latency_ms,
    );

    let finding = LeafFinding {
        title: format!("Review: {}", function.qualifier),
        summary: response.content.clone(),
        priority_rank: 2,
    };

    if let Ok(payload) = serde_json::to_string(&finding) {
        if let Err(err) = ctx.cache.store(
            std::path::Path::new(module_path),
            Scope::Function,
            &function.qualifier,
            &payload,
            response.input_tokens + response.output_tokens,
        ) {
            tracing::error!(%err, function = %function.qualifier, "cache write failed, continuing uncached");
        }
    }

    Ok(finding)
}

/// §4.9 step 6: a Module activation fans out one Class agent per class
/// definition and one Function agent per standalone function, then
/// synthesizes a Review card over everything its children found.
pub fn run_module(
    ctx: Arc<WalkContext>,
    parent_agent_id: String,
    module_path: String,
) -> Pin<Box<dyn Future<Output = AgentOutcome> + Send>> {
    Box::pin(async move {
        let target = Target::new(module_path.clone());
        let mut runtime = match AgentRuntime::begin(
            ctx.store.clone(),
            Some(parent_agent_id.clone()),
            Scope::Module,
            target.clone(),
            ctx.session_id,
        )
        .await
        {
            Ok(runtime) => runtime,
            Err(err) => {
                tracing::error!(%err, module = %module_path, "failed to begin module agent");
                return AgentOutcome {
                    agent_id: String::new(),
                    card_ids: vec![],
                    findings: vec![],
                    errored: true,
                    errors: vec![format!("failed to begin module agent for {module_path}: {err}")],
                };
            }
        };
        let agent_id = runtime.id().to_string();

        let classes = ctx.graph.classes(&module_path);
        let standalone_functions = ctx.graph.functions(&module_path, None);

        let mut handles = Vec::new();
        for class in classes {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let ctx = ctx.clone();
            let agent_id = agent_id.clone();
            let module_path = module_path.clone();
            handles.push(tokio::spawn(async move { run_class(ctx, agent_id, module_path, class).await }));
        }
        for function in standalone_functions {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let permit = match acquire_or_cancelled(&ctx.semaphores.functions, &ctx.cancel).await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let ctx = ctx.clone();
            let agent_id = agent_id.clone();
            let module_path_owned = module_path.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                run_function(ctx, agent_id, module_path_owned, function).await
            }));
        }

        let mut children = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(outcome) => children.push(outcome),
                Err(err) => tracing::error!(%err, "agent task panicked"),
            }
        }

        for child in children.iter().map(|c| c.agent_id.clone()).filter(|id| !id.is_empty()) {
            runtime.attach_child(child);
        }

        let synthesis = synthesize(&ctx, &mut runtime, Scope::Module, &target, &children, cartograph_types::CardType::Review, false)
            .await
            .unwrap_or_else(|err| {
                tracing::error!(%err, module = %module_path, "module synthesis failed");
                None
            });

        let mut card_ids: Vec<String> = children.iter().flat_map(|c| c.card_ids.clone()).collect();
        card_ids.extend(synthesis);
        let findings: Vec<String> = children.iter().flat_map(|c| c.findings.clone()).collect();
        let mut errors: Vec<String> = children.iter().flat_map(|c| c.errors.clone()).collect();
        let any_child_errored = children.iter().any(|c| c.errored);

        ctx.counters.modules_done.fetch_add(1, Ordering::Relaxed);
        publish_progress(&ctx);

        let snapshot = runtime.complete("module analyzed").await;
        match snapshot {
            Ok(_) => AgentOutcome { agent_id, card_ids, findings, errored: any_child_errored, errors },
            Err(err) => {
                tracing::error!(%err, agent_id = %agent_id, "failed to complete module agent");
                errors.push(format!("failed to complete module agent {agent_id}: {err}"));
                AgentOutcome { agent_id, card_ids, findings, errored: true, errors }
            }
        }
    })
}

async fn run_class(
    ctx: Arc<WalkContext>,
    parent_agent_id: String,
    module_path: String,
    class: crate::external::ClassDescriptor,
) -> AgentOutcome {
    let target = Target::with_qualifier(module_path.clone(), class.qualifier.clone());
    let mut runtime = match AgentRuntime::begin(
        ctx.store.clone(),
        Some(parent_agent_id.clone()),
        Scope::Class,
        target.clone(),
        ctx.session_id,
    )
    .await
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(%err, class = %class.qualifier, "failed to begin class agent");
            return AgentOutcome {
                agent_id: String::new(),
                card_ids: vec![],
                findings: vec![],
                errored: true,
                errors: vec![format!("failed to begin class agent for {}: {err}", class.qualifier)],
            };
        }
    };
    let agent_id = runtime.id().to_string();

    let methods = ctx.graph.functions(&module_path, Some(&class.qualifier));
    let mut handles = Vec::new();
    for method in methods {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let permit = match acquire_or_cancelled(&ctx.semaphores.functions, &ctx.cancel).await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let ctx = ctx.clone();
        let agent_id = agent_id.clone();
        let module_path_owned = module_path.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            run_function(ctx, agent_id, module_path_owned, method).await
        }));
    }

    let mut children = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(outcome) => children.push(outcome),
            Err(err) => tracing::error!(%err, "method agent task panicked"),
        }
    }
    for child in children.iter().map(|c| c.agent_id.clone()).filter(|id| !id.is_empty()) {
        runtime.attach_child(child);
    }

    let synthesis = synthesize(&ctx, &mut runtime, Scope::Class, &target, &children, cartograph_types::CardType::Review, false)
        .await
        .unwrap_or_else(|err| {
            tracing::error!(%err, class = %class.qualifier, "class synthesis failed");
            None
        });

    let mut card_ids: Vec<String> = children.iter().flat_map(|c| c.card_ids.clone()).collect();
    card_ids.extend(synthesis);
    let findings: Vec<String> = children.iter().flat_map(|c| c.findings.clone()).collect();
    let mut errors: Vec<String> = children.iter().flat_map(|c| c.errors.clone()).collect();
    let any_child_errored = children.iter().any(|c| c.errored);

    match runtime.complete("class analyzed").await {
        Ok(_) => AgentOutcome { agent_id, card_ids, findings, errored: any_child_errored, errors },
        Err(err) => {
            tracing::error!(%err, agent_id = %agent_id, "failed to complete class agent");
            errors.push(format!("failed to complete class agent {agent_id}: {err}"));
            AgentOutcome { agent_id, card_ids, findings, errored: true, errors }
        }
    }
}

/// §4.9 steps 4–6: a Subsystem activation partitions its module set one
/// directory level deeper, spawning nested Subsystem agents for
/// subdirectories and Module agents for files it owns directly.
pub fn run_subsystem(
    ctx: Arc<WalkContext>,
    parent_agent_id: String,
    name: String,
    depth: usize,
    module_paths: Vec<String>,
) -> Pin<Box<dyn Future<Output = AgentOutcome> + Send>> {
    Box::pin(async move {
        let target = Target::new(name.clone());
        let mut runtime = match AgentRuntime::begin(
            ctx.store.clone(),
            Some(parent_agent_id.clone()),
            Scope::Subsystem,
            target.clone(),
            ctx.session_id,
        )
        .await
        {
            Ok(runtime) => runtime,
            Err(err) => {
                tracing::error!(%err, subsystem = %name, "failed to begin subsystem agent");
                return AgentOutcome {
                    agent_id: String::new(),
                    card_ids: vec![],
                    findings: vec![],
                    errored: true,
                    errors: vec![format!("failed to begin subsystem agent for {name}: {err}")],
                };
            }
        };
        let agent_id = runtime.id().to_string();

        let (direct_modules, nested_groups) = group_by_prefix(&module_paths, depth);

        let mut handles = Vec::new();
        for (nested_name, nested_paths) in nested_groups {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let permit = match acquire_or_cancelled(&ctx.semaphores.subsystems, &ctx.cancel).await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let ctx = ctx.clone();
            let agent_id = agent_id.clone();
            let full_name = format!("{name}/{nested_name}");
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                run_subsystem(ctx, agent_id, full_name, depth + 1, nested_paths).await
            }));
        }
        for module_path in direct_modules {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let permit = match acquire_or_cancelled(&ctx.semaphores.modules, &ctx.cancel).await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let ctx = ctx.clone();
            let agent_id = agent_id.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                run_module(ctx, agent_id, module_path).await
            }));
        }

        let mut children = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(outcome) => children.push(outcome),
                Err(err) => tracing::error!(%err, "subsystem child task panicked"),
            }
        }
        for child in children.iter().map(|c| c.agent_id.clone()).filter(|id| !id.is_empty()) {
            runtime.attach_child(child);
        }

        let synthesis = synthesize(&ctx, &mut runtime, Scope::Subsystem, &target, &children, cartograph_types::CardType::Review, false)
            .await
            .unwrap_or_else(|err| {
                tracing::error!(%err, subsystem = %name, "subsystem synthesis failed");
                None
            });

        let mut card_ids: Vec<String> = children.iter().flat_map(|c| c.card_ids.clone()).collect();
        card_ids.extend(synthesis);
        let findings: Vec<String> = children.iter().flat_map(|c| c.findings.clone()).collect();
        let mut errors: Vec<String> = children.iter().flat_map(|c| c.errors.clone()).collect();
        let any_child_errored = children.iter().any(|c| c.errored);

        match runtime.complete("subsystem analyzed").await {
            Ok(_) => AgentOutcome { agent_id, card_ids, findings, errored: any_child_errored, errors },
            Err(err) => {
                tracing::error!(%err, agent_id = %agent_id, "failed to complete subsystem agent");
                errors.push(format!("failed to complete subsystem agent {agent_id}: {err}"));
                AgentOutcome { agent_id, card_ids, findings, errored: true, errors }
            }
        }
    })
}

/// §4.9 steps 3–8: the System activation. `restrict_to`, when set, limits
/// Module fan-out to paths in the set — used by `AnalyzeIncremental`.
pub async fn run_system(
    ctx: Arc<WalkContext>,
    root_path: &str,
    restrict_to: Option<&std::collections::HashSet<String>>,
) -> AgentOutcome {
    let target = Target::new(root_path);
    let mut runtime = match AgentRuntime::begin(ctx.store.clone(), None, Scope::System, target.clone(), ctx.session_id).await {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(%err, "failed to begin system agent");
            return AgentOutcome {
                agent_id: String::new(),
                card_ids: vec![],
                findings: vec![],
                errored: true,
                errors: vec![format!("failed to begin system agent: {err}")],
            };
        }
    };
    let agent_id = runtime.id().to_string();

    let mut modules: Vec<String> = ctx.graph.modules().into_iter().map(|m| m.path).collect();
    if let Some(restrict_to) = restrict_to {
        modules.retain(|path| restrict_to.contains(path));
    }
    ctx.counters.modules_total.store(modules.len() as u64, Ordering::Relaxed);
    ctx.counters
        .functions_total
        .store(modules.iter().map(|m| ctx.graph.functions(m, None).len() as u64).sum(), Ordering::Relaxed);

    let (direct_modules, groups) = group_by_prefix(&modules, 0);

    let mut handles = Vec::new();
    for (subsystem_name, paths) in groups {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let permit = match acquire_or_cancelled(&ctx.semaphores.subsystems, &ctx.cancel).await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let ctx = ctx.clone();
        let agent_id = agent_id.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            run_subsystem(ctx, agent_id, subsystem_name, 1, paths).await
        }));
    }
    if !direct_modules.is_empty() && !ctx.cancel.is_cancelled() {
        if let Ok(permit) = acquire_or_cancelled(&ctx.semaphores.subsystems, &ctx.cancel).await {
            let ctx = ctx.clone();
            let agent_id = agent_id.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                run_subsystem(ctx, agent_id, "root".to_string(), 1, direct_modules).await
            }));
        }
    }

    let mut children = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(outcome) => children.push(outcome),
            Err(err) => tracing::error!(%err, "subsystem task panicked"),
        }
    }
    for child in children.iter().map(|c| c.agent_id.clone()).filter(|id| !id.is_empty()) {
        runtime.attach_child(child);
    }

    let mut errors: Vec<String> = children.iter().flat_map(|c| c.errors.clone()).collect();

    let synthesis = if ctx.cancel.is_cancelled() {
        None
    } else {
        synthesize(&ctx, &mut runtime, Scope::System, &target, &children, cartograph_types::CardType::Architecture, true)
            .await
            .unwrap_or_else(|err| {
                tracing::error!(%err, "system synthesis failed");
                errors.push(format!("system synthesis failed: {err}"));
                None
            })
    };

    let mut card_ids: Vec<String> = children.iter().flat_map(|c| c.card_ids.clone()).collect();
    card_ids.extend(synthesis);
    let findings: Vec<String> = children.iter().flat_map(|c| c.findings.clone()).collect();
    let any_child_errored = children.iter().any(|c| c.errored);

    if ctx.cancel.is_cancelled() {
        let _ = runtime.fail(CoreError::Cancelled).await;
        errors.push("analysis cancelled".to_string());
        return AgentOutcome { agent_id, card_ids, findings, errored: true, errors };
    }

    match runtime.complete("analysis complete").await {
        Ok(_) => AgentOutcome { agent_id, card_ids, findings, errored: any_child_errored, errors },
        Err(err) => {
            tracing::error!(%err, agent_id = %agent_id, "failed to complete system agent");
            errors.push(format!("failed to complete system agent {agent_id}: {err}"));
            AgentOutcome { agent_id, card_ids, findings, errored: true, errors }
        }
    }
}

fn publish_progress(ctx: &WalkContext) {
    ctx.progress.publish(ProgressEvent::AnalysisProgress {
        session_id: ctx.session_id,
        modules_done: ctx.counters.modules_done.load(Ordering::Relaxed),
        modules_total: ctx.counters.modules_total.load(Ordering::Relaxed),
        functions_done: ctx.counters.functions_done.load(Ordering::Relaxed),
        functions_total: ctx.counters.functions_total.load(Ordering::Relaxed),
        cache_hits: ctx.counters.cache_hits.load(Ordering::Relaxed),
        cache_misses: ctx.counters.cache_misses.load(Ordering::Relaxed),
    });
}
