//! Checklist engine: prioritized, scoped task lists with briefings and
//! plan synchronization.

use chrono::{Duration, Utc};
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use anchor_store::metadata::MetadataStore;
use anchor_types::checklist::{
    ChecklistItem, ChecklistPriority, ChecklistScope, ChecklistStatus,
};
use anchor_types::error::{AnchorError, AnchorResult};

/// Default briefing size.
const BRIEFING_LIMIT: usize = 12;

/// A new checklist item.
#[derive(Debug, Clone)]
pub struct CreateItem {
    pub content: String,
    pub scope: ChecklistScope,
    pub priority: ChecklistPriority,
    pub tags: Vec<String>,
    /// Optional TTL in days.
    pub ttl_days: Option<i64>,
}

impl Default for CreateItem {
    fn default() -> Self {
        Self {
            content: String::new(),
            scope: ChecklistScope::Project,
            priority: ChecklistPriority::Normal,
            tags: Vec::new(),
            ttl_days: None,
        }
    }
}

/// A partial update; None leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct ItemPatch {
    pub content: Option<String>,
    pub status: Option<ChecklistStatus>,
    pub scope: Option<ChecklistScope>,
    pub priority: Option<ChecklistPriority>,
    pub tags: Option<Vec<String>>,
}

/// Result of synchronizing a plan document.
#[derive(Debug, Default)]
pub struct PlanSyncOutcome {
    /// Short ids marked done.
    pub completed: Vec<String>,
    /// Short ids reopened.
    pub reopened: Vec<String>,
    /// Items created from `@persist` lines.
    pub created: Vec<ChecklistItem>,
}

/// Persistent task lists over the metadata store.
pub struct ChecklistEngine {
    store: Arc<MetadataStore>,
    checkbox: Regex,
    ma_ref: Regex,
    persist_tag: Regex,
}

impl ChecklistEngine {
    /// Build the engine. Plan-parsing patterns compile once here.
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self {
            store,
            // Forgiving of indentation, list dashes, and case.
            checkbox: Regex::new(r"(?i)^\s*-?\s*\[(x| )\]\s*").unwrap(),
            ma_ref: Regex::new(r"(?i)\(ma:([a-f0-9]{8})\)").unwrap(),
            persist_tag: Regex::new(r"(?i)@persist").unwrap(),
        }
    }

    /// Create an item.
    pub fn create(&self, project_id: &str, request: CreateItem) -> AnchorResult<ChecklistItem> {
        if request.content.trim().is_empty() {
            return Err(AnchorError::InvalidArgument(
                "checklist content must not be empty".to_string(),
            ));
        }
        let now = Utc::now();
        let item = ChecklistItem {
            id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            content: request.content,
            status: ChecklistStatus::Open,
            scope: request.scope,
            priority: request.priority,
            tags: request.tags,
            created_at: now,
            updated_at: now,
            completed_at: None,
            expires_at: request.ttl_days.map(|d| now + Duration::days(d)),
        };
        self.store.insert_item(&item)?;
        debug!(id = %item.id, project = project_id, "checklist item created");
        Ok(item)
    }

    /// Apply a partial update.
    pub fn update(&self, id: Uuid, patch: ItemPatch) -> AnchorResult<ChecklistItem> {
        let mut item = self
            .store
            .get_item(id)?
            .ok_or_else(|| AnchorError::NotFound(format!("checklist item {id}")))?;
        if let Some(content) = patch.content {
            item.content = content;
        }
        if let Some(status) = patch.status {
            item.status = status;
            item.completed_at = match status {
                ChecklistStatus::Done => Some(Utc::now()),
                _ => None,
            };
        }
        if let Some(scope) = patch.scope {
            item.scope = scope;
        }
        if let Some(priority) = patch.priority {
            item.priority = priority;
        }
        if let Some(tags) = patch.tags {
            item.tags = tags;
        }
        item.updated_at = Utc::now();
        self.store.update_item(&item)?;
        Ok(item)
    }

    /// Delete an item.
    pub fn delete(&self, id: Uuid) -> AnchorResult<()> {
        self.store.delete_item(id)
    }

    /// List items for a project.
    pub fn list(
        &self,
        project_id: &str,
        status: Option<ChecklistStatus>,
        scope: Option<ChecklistScope>,
        limit: usize,
    ) -> AnchorResult<Vec<ChecklistItem>> {
        self.store.list_items(project_id, status, scope, limit)
    }

    /// Markdown digest of open items, grouped by priority, each bearing its
    /// `(ma:<prefix>)` reference token.
    pub fn briefing(
        &self,
        project_id: &str,
        scope: Option<ChecklistScope>,
        limit: Option<usize>,
    ) -> AnchorResult<String> {
        let items = self.store.list_items(
            project_id,
            Some(ChecklistStatus::Open),
            scope,
            limit.unwrap_or(BRIEFING_LIMIT),
        )?;

        if items.is_empty() {
            return Ok("**Checklist briefing**\n\nNo open items.".to_string());
        }

        let mut lines = vec!["**Checklist briefing**".to_string(), String::new()];
        let mut current_priority: Option<ChecklistPriority> = None;
        for item in &items {
            if current_priority != Some(item.priority) {
                if current_priority.is_some() {
                    lines.push(String::new());
                }
                lines.push(format!("### {}", item.priority.label()));
                current_priority = Some(item.priority);
            }
            let tags = if item.tags.is_empty() {
                String::new()
            } else {
                format!(
                    " {}",
                    item.tags
                        .iter()
                        .map(|t| format!("`{t}`"))
                        .collect::<Vec<_>>()
                        .join(" ")
                )
            };
            lines.push(format!("- [ ] {} {}{}", item.content, item.ma_ref(), tags));
        }
        Ok(lines.join("\n"))
    }

    /// Parse plan markdown and update referenced items.
    ///
    /// `[x]` lines with an `(ma:<prefix>)` reference mark the item done;
    /// `[ ]` lines reopen it. References to absent items are ignored, never
    /// created. Lines tagged `@persist` become new items tagged `from-plan`.
    pub fn sync_from_plan(
        &self,
        project_id: &str,
        plan_markdown: &str,
        session_id: Option<&str>,
    ) -> AnchorResult<PlanSyncOutcome> {
        let mut outcome = PlanSyncOutcome::default();

        for line in plan_markdown.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(captures) = self.checkbox.captures(line) {
                let checked = captures
                    .get(1)
                    .map(|m| m.as_str().eq_ignore_ascii_case("x"))
                    .unwrap_or(false);
                for reference in self.ma_ref.captures_iter(line) {
                    let prefix = reference.get(1).map(|m| m.as_str().to_lowercase());
                    let Some(prefix) = prefix else { continue };
                    let Some(item) = self.store.get_item_by_short_id(project_id, &prefix)? else {
                        continue;
                    };
                    let target = if checked {
                        ChecklistStatus::Done
                    } else {
                        ChecklistStatus::Open
                    };
                    if item.status == target {
                        continue;
                    }
                    self.update(
                        item.id,
                        ItemPatch {
                            status: Some(target),
                            ..ItemPatch::default()
                        },
                    )?;
                    if checked {
                        outcome.completed.push(prefix);
                    } else {
                        outcome.reopened.push(prefix);
                    }
                }
            }

            if self.persist_tag.is_match(line) {
                let content = self.checkbox.replace(line, "");
                let content = self.persist_tag.replace_all(&content, "").trim().to_string();
                if !content.is_empty() {
                    let mut tags = vec!["from-plan".to_string()];
                    if let Some(session) = session_id {
                        tags.push(session.to_string());
                    }
                    let item = self.create(
                        project_id,
                        CreateItem {
                            content,
                            tags,
                            ..CreateItem::default()
                        },
                    )?;
                    outcome.created.push(item);
                }
            }
        }

        info!(
            project = project_id,
            completed = outcome.completed.len(),
            reopened = outcome.reopened.len(),
            created = outcome.created.len(),
            "plan sync finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> ChecklistEngine {
        ChecklistEngine::new(Arc::new(MetadataStore::in_memory().unwrap()))
    }

    fn create(engine: &ChecklistEngine, content: &str, priority: ChecklistPriority) -> ChecklistItem {
        engine
            .create(
                "demo",
                CreateItem {
                    content: content.to_string(),
                    priority,
                    ..CreateItem::default()
                },
            )
            .unwrap()
    }

    #[test]
    fn test_briefing_groups_by_priority() {
        let engine = setup();
        create(&engine, "fix the build", ChecklistPriority::Critical);
        create(&engine, "refactor parser", ChecklistPriority::Normal);
        create(&engine, "polish docs", ChecklistPriority::Normal);

        let briefing = engine.briefing("demo", None, None).unwrap();
        let critical_pos = briefing.find("### Critical").unwrap();
        let normal_pos = briefing.find("### Normal").unwrap();
        assert!(critical_pos < normal_pos);
        assert!(briefing.contains("fix the build"));
        assert!(briefing.contains("(ma:"));
    }

    #[test]
    fn test_briefing_empty() {
        let engine = setup();
        let briefing = engine.briefing("demo", None, None).unwrap();
        assert!(briefing.contains("No open items"));
    }

    #[test]
    fn test_sync_marks_done_by_reference() {
        let engine = setup();
        let item = create(&engine, "write tests", ChecklistPriority::Normal);
        let plan = format!("- [x] write tests {}", item.ma_ref());

        let outcome = engine.sync_from_plan("demo", &plan, None).unwrap();
        assert_eq!(outcome.completed, vec![item.short_id()]);
        let reloaded = engine.store.get_item(item.id).unwrap().unwrap();
        assert_eq!(reloaded.status, ChecklistStatus::Done);
        assert!(reloaded.completed_at.is_some());
    }

    #[test]
    fn test_sync_reopens_unchecked() {
        let engine = setup();
        let item = create(&engine, "write tests", ChecklistPriority::Normal);
        engine
            .update(
                item.id,
                ItemPatch {
                    status: Some(ChecklistStatus::Done),
                    ..ItemPatch::default()
                },
            )
            .unwrap();

        let plan = format!("  - [ ] write tests {}", item.ma_ref());
        let outcome = engine.sync_from_plan("demo", &plan, None).unwrap();
        assert_eq!(outcome.reopened, vec![item.short_id()]);
        let reloaded = engine.store.get_item(item.id).unwrap().unwrap();
        assert_eq!(reloaded.status, ChecklistStatus::Open);
    }

    #[test]
    fn test_sync_ignores_unknown_references() {
        let engine = setup();
        let outcome = engine
            .sync_from_plan("demo", "- [x] mystery task (ma:deadbeef)", None)
            .unwrap();
        assert!(outcome.completed.is_empty());
        assert!(engine.list("demo", None, None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_sync_is_case_and_whitespace_forgiving() {
        let engine = setup();
        let item = create(&engine, "write tests", ChecklistPriority::Normal);
        let upper_ref = item.ma_ref().to_uppercase();
        let plan = format!("   -  [X]   write tests   {upper_ref}");
        let outcome = engine.sync_from_plan("demo", &plan, None).unwrap();
        assert_eq!(outcome.completed.len(), 1);
    }

    #[test]
    fn test_persist_lines_create_items() {
        let engine = setup();
        let plan = "- [ ] follow up on cache invalidation @persist";
        let outcome = engine.sync_from_plan("demo", plan, Some("sess-7")).unwrap();
        assert_eq!(outcome.created.len(), 1);
        let created = &outcome.created[0];
        assert_eq!(created.content, "follow up on cache invalidation");
        assert!(created.tags.contains(&"from-plan".to_string()));
        assert!(created.tags.contains(&"sess-7".to_string()));
    }

    #[test]
    fn test_item_ttl() {
        let engine = setup();
        let item = engine
            .create(
                "demo",
                CreateItem {
                    content: "expiring task".to_string(),
                    ttl_days: Some(7),
                    ..CreateItem::default()
                },
            )
            .unwrap();
        assert!(item.expires_at.unwrap() > Utc::now());
    }
}
