use std::path::Path;
use std::sync::{Arc, Mutex};

use cartograph_core::ProgressBus;
use cartograph_types::{
    AnalysisSession, AuditEntry, Card, CardStatus, CardType, CoreError, CoreResult, Priority,
    ProgressEvent, ProposedFix, Scope, SessionMode, Target,
};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use uuid::Uuid;

use crate::schema::SCHEMA;

/// An Agent as held by the Store: the persisted shape, distinct from
/// `cartograph-agent`'s in-memory runtime view of one activation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub scope: Scope,
    pub target: Target,
    pub status: cartograph_types::AgentStatus,
    pub parent_id: Option<String>,
    pub child_ids: Vec<String>,
    pub session_id: Uuid,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub findings: Vec<String>,
    pub created_card_ids: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct CardFilter {
    pub card_type: Option<CardType>,
    pub status: Option<CardStatus>,
    pub owner_agent: Option<String>,
    pub parent_card_id: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Default, Clone)]
pub struct CardPatch {
    pub status: Option<CardStatus>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub priority: Option<Priority>,
    pub risk: Option<f64>,
    pub confidence: Option<f64>,
    pub coverage_impact: Option<f64>,
    pub from_view: Option<Option<String>>,
    pub to_view: Option<Option<String>>,
    pub proposed_fix: Option<Option<ProposedFix>>,
}

/// Persistent record of cards, agents, analysis sessions and the id
/// sequences that name them. Every multi-table write happens inside a
/// single sqlite transaction; `ProgressBus` events for cards are only
/// published once that transaction commits.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    progress: ProgressBus,
}

impl Store {
    pub fn open(path: &Path, progress: ProgressBus) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| CoreError::Storage(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            progress,
        })
    }

    pub fn open_in_memory(progress: ProgressBus) -> CoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| CoreError::Storage(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            progress,
        })
    }

    /// Accepts a unit of work run inside a single sqlite transaction.
    fn with_tx<T>(&self, f: impl FnOnce(&Transaction) -> CoreResult<T>) -> CoreResult<T> {
        let mut guard = self.conn.lock().expect("store mutex poisoned");
        let tx = guard
            .transaction()
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        let result = f(&tx)?;
        tx.commit().map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(result)
    }

    /// `IdAllocator::Next(name)`: returns the next value for a named
    /// sequence and advances the stored value atomically. Must be called
    /// from within an open transaction to be serializable with concurrent
    /// callers touching the same name.
    fn next_id_tx(tx: &Transaction, name: &str) -> CoreResult<i64> {
        tx.execute(
            "INSERT INTO id_sequences(name, value) VALUES (?1, 1)
             ON CONFLICT(name) DO UPDATE SET value = value + 1",
            params![name],
        )
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        let value: i64 = tx
            .query_row(
                "SELECT value FROM id_sequences WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(value)
    }

    pub fn next_id(&self, name: &str) -> CoreResult<i64> {
        let name = name.to_string();
        self.with_tx(|tx| Self::next_id_tx(tx, &name))
    }

    // ---- Cards ----------------------------------------------------------

    pub fn create_card(
        &self,
        project: &str,
        card_type: CardType,
        owner_agent_id: &str,
        title: &str,
        summary: &str,
    ) -> CoreResult<Card> {
        let now = Utc::now();
        let card = self.with_tx(|tx| {
            let seq_name = format!("card_{}", card_type.kind_code());
            let n = Self::next_id_tx(tx, &seq_name)?;
            let id = format!("{}-{}-{}-{:04}", project, now.format("%Y"), card_type.kind_code(), n);
            let mut card = Card::new(id, card_type, owner_agent_id, title, summary, now);
            card.push_audit(owner_agent_id, "created", None, now);
            insert_card(tx, &card)?;

            if let Some(mut agent) = select_agent(tx, owner_agent_id)? {
                agent.created_card_ids.push(card.id.clone());
                update_agent_row(tx, &agent)?;
            }
            Ok(card)
        })?;
        self.progress.publish(ProgressEvent::CardCreated { card: card.clone() });
        Ok(card)
    }

    pub fn get_card(&self, id: &str) -> CoreResult<Card> {
        let guard = self.conn.lock().expect("store mutex poisoned");
        select_card(&guard, id)?.ok_or_else(|| CoreError::NotFound(format!("card {id}")))
    }

    pub fn list_cards(&self, filter: &CardFilter) -> CoreResult<Vec<Card>> {
        let guard = self.conn.lock().expect("store mutex poisoned");
        let mut sql = String::from("SELECT id FROM cards WHERE 1=1");
        if filter.card_type.is_some() {
            sql.push_str(" AND card_type = :card_type");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = :status");
        }
        if filter.owner_agent.is_some() {
            sql.push_str(" AND owner_agent_id = :owner_agent");
        }
        if filter.parent_card_id.is_some() {
            sql.push_str(" AND parent_card_id = :parent_card_id");
        }
        sql.push_str(" ORDER BY created_at ASC LIMIT :limit OFFSET :offset");

        let mut stmt = guard.prepare(&sql).map_err(|e| CoreError::Storage(e.to_string()))?;
        let card_type = filter.card_type.map(|t| t.kind_code().to_string());
        let status = filter.status.map(|s| serde_json::to_value(s).unwrap().as_str().unwrap().to_string());
        let limit = if filter.limit > 0 { filter.limit } else { i64::MAX };
        let ids: Vec<String> = stmt
            .query_map(
                rusqlite::named_params! {
                    ":card_type": card_type,
                    ":status": status,
                    ":owner_agent": filter.owner_agent,
                    ":parent_card_id": filter.parent_card_id,
                    ":limit": limit,
                    ":offset": filter.offset,
                },
                |row| row.get::<_, String>(0),
            )
            .map_err(|e| CoreError::Storage(e.to_string()))?
            .collect::<Result<_, _>>()
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        ids.into_iter()
            .map(|id| select_card(&guard, &id).transpose().unwrap())
            .collect()
    }

    /// Applies a partial patch to a card. If the patch changes `status`,
    /// the transition must be legal per the card state machine or the
    /// write is rejected with `IllegalTransition`. Always appends an audit
    /// log entry in the same transaction.
    pub fn update_card(&self, id: &str, patch: CardPatch, actor: &str) -> CoreResult<Card> {
        let now = Utc::now();
        let card = self.with_tx(|tx| {
            let mut card = select_card(tx, id)?.ok_or_else(|| CoreError::NotFound(format!("card {id}")))?;

            if let Some(next_status) = patch.status {
                if next_status == CardStatus::Proposed && card.proposed_fix.is_none() && patch.proposed_fix.is_none() {
                    return Err(CoreError::IllegalTransition {
                        from: format!("{:?}", card.status),
                        to: format!("{next_status:?} (missing proposed fix)"),
                    });
                }
                if !card.status.can_transition_to(next_status) {
                    return Err(CoreError::IllegalTransition {
                        from: format!("{:?}", card.status),
                        to: format!("{next_status:?}"),
                    });
                }
                card.status = next_status;
            }
            if let Some(title) = patch.title {
                card.title = title;
            }
            if let Some(summary) = patch.summary {
                card.summary = summary;
            }
            if let Some(priority) = patch.priority {
                card.priority = priority;
            }
            if let Some(risk) = patch.risk {
                card.risk = risk;
            }
            if let Some(confidence) = patch.confidence {
                card.confidence = confidence;
            }
            if let Some(coverage_impact) = patch.coverage_impact {
                card.coverage_impact = coverage_impact;
            }
            if let Some(from_view) = patch.from_view {
                card.from_view = from_view;
            }
            if let Some(to_view) = patch.to_view {
                card.to_view = to_view;
            }
            if let Some(proposed_fix) = patch.proposed_fix {
                card.proposed_fix = proposed_fix;
            }
            card.push_audit(actor, "updated", None, now);
            insert_card(tx, &card)?;
            Ok(card)
        })?;
        self.progress.publish(ProgressEvent::CardUpdated { card: card.clone() });
        Ok(card)
    }

    pub fn delete_card(&self, id: &str) -> CoreResult<()> {
        self.with_tx(|tx| {
            tx.execute("DELETE FROM cards WHERE id = ?1", params![id])
                .map_err(|e| CoreError::Storage(e.to_string()))?;
            Ok(())
        })?;
        self.progress.publish(ProgressEvent::CardDeleted { card_id: id.to_string() });
        Ok(())
    }

    // ---- Agents ----------------------------------------------------------

    pub fn create_agent(
        &self,
        scope: Scope,
        target: Target,
        parent_id: Option<String>,
        session_id: Uuid,
    ) -> CoreResult<AgentRecord> {
        self.with_tx(|tx| {
            let seq_name = format!("agent_{}", scope.code());
            let n = Self::next_id_tx(tx, &seq_name)?;
            let id = format!("AGN-{}-{:04}", scope.code(), n);
            let record = AgentRecord {
                id,
                scope,
                target,
                status: cartograph_types::AgentStatus::Idle,
                parent_id: parent_id.clone(),
                child_ids: Vec::new(),
                session_id,
                total_tokens_in: 0,
                total_tokens_out: 0,
                findings: Vec::new(),
                created_card_ids: Vec::new(),
            };
            insert_agent(tx, &record)?;
            if let Some(parent_id) = parent_id {
                if let Some(mut parent) = select_agent(tx, &parent_id)? {
                    parent.child_ids.push(record.id.clone());
                    update_agent_row(tx, &parent)?;
                }
            }
            Ok(record)
        })
    }

    pub fn get_agent(&self, id: &str) -> CoreResult<AgentRecord> {
        let guard = self.conn.lock().expect("store mutex poisoned");
        select_agent(&guard, id)?.ok_or_else(|| CoreError::NotFound(format!("agent {id}")))
    }

    pub fn update_agent_status(&self, id: &str, next: cartograph_types::AgentStatus) -> CoreResult<()> {
        self.with_tx(|tx| {
            let mut agent = select_agent(tx, id)?.ok_or_else(|| CoreError::NotFound(format!("agent {id}")))?;
            if !agent.status.can_transition_to(next) {
                return Err(CoreError::IllegalTransition {
                    from: format!("{:?}", agent.status),
                    to: format!("{next:?}"),
                });
            }
            agent.status = next;
            update_agent_row(tx, &agent)?;
            Ok(())
        })?;
        self.progress.publish(ProgressEvent::AgentStatus {
            agent_id: id.to_string(),
            status: format!("{next:?}"),
            target: String::new(),
        });
        Ok(())
    }

    pub fn record_agent_usage(
        &self,
        id: &str,
        tokens_in: u64,
        tokens_out: u64,
        findings: &[String],
        created_card_ids: &[String],
    ) -> CoreResult<()> {
        self.with_tx(|tx| {
            let mut agent = select_agent(tx, id)?.ok_or_else(|| CoreError::NotFound(format!("agent {id}")))?;
            agent.total_tokens_in += tokens_in;
            agent.total_tokens_out += tokens_out;
            agent.findings.extend_from_slice(findings);
            agent
                .created_card_ids
                .extend(created_card_ids.iter().cloned());
            update_agent_row(tx, &agent)?;
            Ok(())
        })
    }

    pub fn list_agents_by_parent(&self, parent_id: &str) -> CoreResult<Vec<AgentRecord>> {
        let guard = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = guard
            .prepare("SELECT id FROM agents WHERE parent_id = ?1")
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        let ids: Vec<String> = stmt
            .query_map(params![parent_id], |row| row.get(0))
            .map_err(|e| CoreError::Storage(e.to_string()))?
            .collect::<Result<_, _>>()
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        ids.into_iter()
            .map(|id| select_agent(&guard, &id).transpose().unwrap())
            .collect()
    }

    // ---- Sessions ----------------------------------------------------------

    pub fn create_session(&self, id: Uuid, path: &str, mode: SessionMode) -> CoreResult<AnalysisSession> {
        let session = AnalysisSession::new(id, path, mode, Utc::now());
        self.with_tx(|tx| {
            insert_session(tx, &session)?;
            Ok(session)
        })
    }

    pub fn get_session(&self, id: Uuid) -> CoreResult<AnalysisSession> {
        let guard = self.conn.lock().expect("store mutex poisoned");
        select_session(&guard, id)?.ok_or_else(|| CoreError::NotFound(format!("session {id}")))
    }

    /// Records the resolved git coordinates for an incremental session.
    /// Called once, right after `create_session`, before any activation runs.
    pub fn set_session_git_info(&self, id: Uuid, current_commit: &str, base_reference: &str) -> CoreResult<()> {
        self.with_tx(|tx| {
            let mut session = select_session(tx, id)?.ok_or_else(|| CoreError::NotFound(format!("session {id}")))?;
            session.current_commit = Some(current_commit.to_string());
            session.base_reference = Some(base_reference.to_string());
            insert_session(tx, &session)
        })
    }

    /// Finishes a session, writing final counters. Once `completed_at` is
    /// set the session row is never mutated again.
    pub fn complete_session(
        &self,
        id: Uuid,
        files_analyzed: Vec<String>,
        files_skipped: Vec<String>,
        module_count: u64,
        function_count: u64,
        cache_hits: u64,
        cache_misses: u64,
        errors: Vec<String>,
    ) -> CoreResult<AnalysisSession> {
        self.with_tx(|tx| {
            let mut session = select_session(tx, id)?.ok_or_else(|| CoreError::NotFound(format!("session {id}")))?;
            if session.is_immutable() {
                return Err(CoreError::Storage(format!("session {id} already completed")));
            }
            session.files_analyzed = files_analyzed;
            session.files_skipped = files_skipped;
            session.module_count = module_count;
            session.function_count = function_count;
            session.cache_hits = cache_hits;
            session.cache_misses = cache_misses;
            session.errors = errors;
            session.completed_at = Some(Utc::now());
            insert_session(tx, &session)?;
            Ok(session)
        })
    }

    /// Finds the most recently completed session for a path, used as the
    /// default incremental `base_ref` source.
    pub fn last_completed_session(&self, path: &str) -> CoreResult<Option<AnalysisSession>> {
        let guard = self.conn.lock().expect("store mutex poisoned");
        let id: Option<String> = guard
            .query_row(
                "SELECT id FROM analysis_sessions WHERE path = ?1 AND completed_at IS NOT NULL
                 ORDER BY completed_at DESC LIMIT 1",
                params![path],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        match id {
            Some(id) => {
                let uuid = Uuid::parse_str(&id).map_err(|e| CoreError::Storage(e.to_string()))?;
                select_session(&guard, uuid)
            }
            None => Ok(None),
        }
    }
}

fn insert_card(tx: &Transaction, card: &Card) -> CoreResult<()> {
    let links = serde_json::json!({
        "code_refs": card.code_refs,
        "test_refs": card.test_refs,
        "doc_refs": card.doc_refs,
    });
    tx.execute(
        "INSERT INTO cards (id, card_type, status, priority, title, summary, owner_agent_id,
            parent_card_id, child_card_ids, links, risk, confidence, coverage_impact,
            from_view, to_view, proposed_fix, audit_log, created_at, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)
         ON CONFLICT(id) DO UPDATE SET
            status=excluded.status, priority=excluded.priority, title=excluded.title,
            summary=excluded.summary, child_card_ids=excluded.child_card_ids,
            links=excluded.links, risk=excluded.risk, confidence=excluded.confidence,
            coverage_impact=excluded.coverage_impact, from_view=excluded.from_view,
            to_view=excluded.to_view, proposed_fix=excluded.proposed_fix,
            audit_log=excluded.audit_log, updated_at=excluded.updated_at",
        params![
            card.id,
            serde_json::to_value(card.card_type).unwrap().as_str().unwrap(),
            serde_json::to_value(card.status).unwrap().as_str().unwrap(),
            serde_json::to_value(card.priority).unwrap().as_str().unwrap(),
            card.title,
            card.summary,
            card.owner_agent_id,
            card.parent_card_id,
            serde_json::to_string(&card.child_card_ids).unwrap(),
            links.to_string(),
            card.risk,
            card.confidence,
            card.coverage_impact,
            card.from_view,
            card.to_view,
            card.proposed_fix.as_ref().map(|f| serde_json::to_string(f).unwrap()),
            serde_json::to_string(&card.audit_log).unwrap(),
            card.created_at.to_rfc3339(),
            card.updated_at.to_rfc3339(),
        ],
    )
    .map_err(|e| CoreError::Storage(e.to_string()))?;
    Ok(())
}

fn select_card(conn: &Connection, id: &str) -> CoreResult<Option<Card>> {
    conn.query_row("SELECT * FROM cards WHERE id = ?1", params![id], row_to_card)
        .optional()
        .map_err(|e| CoreError::Storage(e.to_string()))
}

fn row_to_card(row: &rusqlite::Row) -> rusqlite::Result<Card> {
    let links: serde_json::Value = serde_json::from_str(&row.get::<_, String>("links")?).unwrap_or_default();
    let proposed_fix: Option<String> = row.get("proposed_fix")?;
    Ok(Card {
        id: row.get("id")?,
        card_type: serde_json::from_value(serde_json::Value::String(row.get("card_type")?)).unwrap(),
        status: serde_json::from_value(serde_json::Value::String(row.get("status")?)).unwrap(),
        priority: serde_json::from_value(serde_json::Value::String(row.get("priority")?)).unwrap(),
        title: row.get("title")?,
        summary: row.get("summary")?,
        owner_agent_id: row.get("owner_agent_id")?,
        parent_card_id: row.get("parent_card_id")?,
        child_card_ids: serde_json::from_str(&row.get::<_, String>("child_card_ids")?).unwrap_or_default(),
        code_refs: serde_json::from_value(links.get("code_refs").cloned().unwrap_or_default()).unwrap_or_default(),
        test_refs: serde_json::from_value(links.get("test_refs").cloned().unwrap_or_default()).unwrap_or_default(),
        doc_refs: serde_json::from_value(links.get("doc_refs").cloned().unwrap_or_default()).unwrap_or_default(),
        risk: row.get("risk")?,
        confidence: row.get("confidence")?,
        coverage_impact: row.get("coverage_impact")?,
        from_view: row.get("from_view")?,
        to_view: row.get("to_view")?,
        proposed_fix: proposed_fix.map(|s| serde_json::from_str(&s).unwrap()),
        audit_log: serde_json::from_str::<Vec<AuditEntry>>(&row.get::<_, String>("audit_log")?).unwrap_or_default(),
        created_at: row.get::<_, String>("created_at")?.parse().unwrap(),
        updated_at: row.get::<_, String>("updated_at")?.parse().unwrap(),
    })
}

fn insert_agent(tx: &Transaction, agent: &AgentRecord) -> CoreResult<()> {
    tx.execute(
        "INSERT INTO agents (id, scope, target_path, target_qualifier, status, parent_id,
            child_ids, session_id, messages, findings, created_card_ids,
            total_tokens_in, total_tokens_out, created_at, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
         ON CONFLICT(id) DO UPDATE SET status=excluded.status, child_ids=excluded.child_ids,
            findings=excluded.findings, created_card_ids=excluded.created_card_ids,
            total_tokens_in=excluded.total_tokens_in, total_tokens_out=excluded.total_tokens_out,
            updated_at=excluded.updated_at",
        params![
            agent.id,
            agent.scope.code(),
            agent.target.path,
            agent.target.qualifier,
            serde_json::to_value(agent.status).unwrap().as_str().unwrap(),
            agent.parent_id,
            serde_json::to_string(&agent.child_ids).unwrap(),
            agent.session_id.to_string(),
            "[]",
            serde_json::to_string(&agent.findings).unwrap(),
            serde_json::to_string(&agent.created_card_ids).unwrap(),
            agent.total_tokens_in as i64,
            agent.total_tokens_out as i64,
            Utc::now().to_rfc3339(),
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(|e| CoreError::Storage(e.to_string()))?;
    Ok(())
}

fn update_agent_row(tx: &Transaction, agent: &AgentRecord) -> CoreResult<()> {
    insert_agent(tx, agent)
}

fn select_agent(conn: &Connection, id: &str) -> CoreResult<Option<AgentRecord>> {
    conn.query_row("SELECT * FROM agents WHERE id = ?1", params![id], row_to_agent)
        .optional()
        .map_err(|e| CoreError::Storage(e.to_string()))
}

fn row_to_agent(row: &rusqlite::Row) -> rusqlite::Result<AgentRecord> {
    Ok(AgentRecord {
        id: row.get("id")?,
        scope: scope_from_code(&row.get::<_, String>("scope")?),
        target: Target {
            path: row.get("target_path")?,
            qualifier: row.get("target_qualifier")?,
        },
        status: serde_json::from_value(serde_json::Value::String(row.get("status")?)).unwrap(),
        parent_id: row.get("parent_id")?,
        child_ids: serde_json::from_str(&row.get::<_, String>("child_ids")?).unwrap_or_default(),
        session_id: row.get::<_, String>("session_id")?.parse().unwrap(),
        total_tokens_in: row.get::<_, i64>("total_tokens_in")? as u64,
        total_tokens_out: row.get::<_, i64>("total_tokens_out")? as u64,
        findings: serde_json::from_str(&row.get::<_, String>("findings")?).unwrap_or_default(),
        created_card_ids: serde_json::from_str(&row.get::<_, String>("created_card_ids")?).unwrap_or_default(),
    })
}

fn scope_from_code(code: &str) -> Scope {
    match code {
        "System" => Scope::System,
        "Subsystem" => Scope::Subsystem,
        "Module" => Scope::Module,
        "Class" => Scope::Class,
        _ => Scope::Function,
    }
}

fn insert_session(tx: &Transaction, session: &AnalysisSession) -> CoreResult<()> {
    tx.execute(
        "INSERT INTO analysis_sessions (id, path, mode, base_reference, current_commit,
            files_analyzed, files_skipped, module_count, function_count, cache_hits,
            cache_misses, started_at, completed_at, errors)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)
         ON CONFLICT(id) DO UPDATE SET files_analyzed=excluded.files_analyzed,
            files_skipped=excluded.files_skipped, module_count=excluded.module_count,
            function_count=excluded.function_count, cache_hits=excluded.cache_hits,
            cache_misses=excluded.cache_misses, completed_at=excluded.completed_at,
            errors=excluded.errors",
        params![
            session.id.to_string(),
            session.path,
            serde_json::to_value(session.mode).unwrap().as_str().unwrap(),
            session.base_reference,
            session.current_commit,
            serde_json::to_string(&session.files_analyzed).unwrap(),
            serde_json::to_string(&session.files_skipped).unwrap(),
            session.module_count as i64,
            session.function_count as i64,
            session.cache_hits as i64,
            session.cache_misses as i64,
            session.started_at.to_rfc3339(),
            session.completed_at.map(|t| t.to_rfc3339()),
            serde_json::to_string(&session.errors).unwrap(),
        ],
    )
    .map_err(|e| CoreError::Storage(e.to_string()))?;
    Ok(())
}

fn select_session(conn: &Connection, id: Uuid) -> CoreResult<Option<AnalysisSession>> {
    conn.query_row(
        "SELECT * FROM analysis_sessions WHERE id = ?1",
        params![id.to_string()],
        row_to_session,
    )
    .optional()
    .map_err(|e| CoreError::Storage(e.to_string()))
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<AnalysisSession> {
    let completed_at: Option<String> = row.get("completed_at")?;
    Ok(AnalysisSession {
        id: row.get::<_, String>("id")?.parse().unwrap(),
        path: row.get("path")?,
        mode: serde_json::from_value(serde_json::Value::String(row.get("mode")?)).unwrap(),
        base_reference: row.get("base_reference")?,
        current_commit: row.get("current_commit")?,
        files_analyzed: serde_json::from_str(&row.get::<_, String>("files_analyzed")?).unwrap_or_default(),
        files_skipped: serde_json::from_str(&row.get::<_, String>("files_skipped")?).unwrap_or_default(),
        module_count: row.get::<_, i64>("module_count")? as u64,
        function_count: row.get::<_, i64>("function_count")? as u64,
        cache_hits: row.get::<_, i64>("cache_hits")? as u64,
        cache_misses: row.get::<_, i64>("cache_misses")? as u64,
        started_at: row.get::<_, String>("started_at")?.parse().unwrap(),
        completed_at: completed_at.map(|s| s.parse().unwrap()),
        errors: serde_json::from_str(&row.get::<_, String>("errors")?).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartograph_types::AgentStatus;

    fn store() -> Store {
        Store::open_in_memory(ProgressBus::new()).unwrap()
    }

    #[test]
    fn create_and_get_card_round_trips() {
        let store = store();
        let agent = store
            .create_agent(Scope::Function, Target::new("src/lib.rs"), None, Uuid::new_v4())
            .unwrap();
        let card = store
            .create_card("PRJ", CardType::Review, &agent.id, "missing zero check", "div lacks a guard")
            .unwrap();
        let fetched = store.get_card(&card.id).unwrap();
        assert_eq!(fetched.id, card.id);
        assert_eq!(fetched.title, "missing zero check");
        assert!(card.id.starts_with("PRJ-"));
        assert!(card.id.contains("REV"));
    }

    #[test]
    fn card_ids_are_monotonic_per_kind() {
        let store = store();
        let agent = store
            .create_agent(Scope::Function, Target::new("a"), None, Uuid::new_v4())
            .unwrap();
        let c1 = store.create_card("PRJ", CardType::Review, &agent.id, "a", "a").unwrap();
        let c2 = store.create_card("PRJ", CardType::Review, &agent.id, "b", "b").unwrap();
        assert_ne!(c1.id, c2.id);
        assert!(c1.id.ends_with("0001"));
        assert!(c2.id.ends_with("0002"));
    }

    #[test]
    fn illegal_card_transition_is_rejected() {
        let store = store();
        let agent = store
            .create_agent(Scope::Function, Target::new("a"), None, Uuid::new_v4())
            .unwrap();
        let card = store.create_card("PRJ", CardType::Review, &agent.id, "t", "s").unwrap();
        let result = store.update_card(
            &card.id,
            CardPatch {
                status: Some(CardStatus::Approved),
                ..Default::default()
            },
            "tester",
        );
        assert!(matches!(result, Err(CoreError::IllegalTransition { .. })));
    }

    #[test]
    fn legal_card_transition_appends_audit_entry() {
        let store = store();
        let agent = store
            .create_agent(Scope::Function, Target::new("a"), None, Uuid::new_v4())
            .unwrap();
        let card = store.create_card("PRJ", CardType::Review, &agent.id, "t", "s").unwrap();
        let updated = store
            .update_card(
                &card.id,
                CardPatch {
                    status: Some(CardStatus::Queued),
                    ..Default::default()
                },
                "tester",
            )
            .unwrap();
        assert_eq!(updated.status, CardStatus::Queued);
        assert_eq!(updated.audit_log.len(), 2);
    }

    #[test]
    fn agent_status_transitions_enforce_state_machine() {
        let store = store();
        let agent = store
            .create_agent(Scope::Module, Target::new("src"), None, Uuid::new_v4())
            .unwrap();
        store.update_agent_status(&agent.id, AgentStatus::Analyzing).unwrap();
        let illegal = store.update_agent_status(&agent.id, AgentStatus::Idle);
        assert!(matches!(illegal, Err(CoreError::IllegalTransition { .. })));
    }

    #[test]
    fn parent_child_attachment_is_reciprocal() {
        let store = store();
        let parent = store
            .create_agent(Scope::Module, Target::new("src"), None, Uuid::new_v4())
            .unwrap();
        let child = store
            .create_agent(Scope::Function, Target::new("src/lib.rs"), Some(parent.id.clone()), Uuid::new_v4())
            .unwrap();
        let refreshed_parent = store.get_agent(&parent.id).unwrap();
        assert_eq!(refreshed_parent.child_ids, vec![child.id.clone()]);
        assert_eq!(child.parent_id, Some(parent.id));
    }

    #[test]
    fn session_is_immutable_once_completed() {
        let store = store();
        let id = Uuid::new_v4();
        store.create_session(id, "/proj", SessionMode::Full).unwrap();
        store
            .complete_session(id, vec![], vec![], 0, 0, 0, 0, vec![])
            .unwrap();
        let result = store.complete_session(id, vec![], vec![], 1, 1, 1, 1, vec![]);
        assert!(result.is_err());
    }

    #[test]
    fn session_git_info_survives_completion() {
        let store = store();
        let id = Uuid::new_v4();
        store.create_session(id, "/proj", SessionMode::Incremental).unwrap();
        store.set_session_git_info(id, "abc123", "def456").unwrap();
        let session = store.complete_session(id, vec![], vec![], 0, 0, 0, 0, vec![]).unwrap();
        assert_eq!(session.current_commit, Some("abc123".to_string()));
        assert_eq!(session.base_reference, Some("def456".to_string()));
    }
}
