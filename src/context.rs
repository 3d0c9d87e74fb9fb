//! Builds the bounded textual context handed to the model for a new turn.
//!
//! Sections, each omitted when empty, in this order:
//! referenced conversations, summarized older turns, cited excerpts, and the
//! verbatim transcript of the most recent turns.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::db::{Citation, Node, Reference, ReferenceType};
use crate::error::{GraphError, Result};
use crate::resolver::TreeResolver;
use crate::utils::preview;

/// Turns rendered verbatim; anything older is reduced to one summary line.
pub const RECENT_WINDOW: usize = 10;

/// Characters of the prompt used when a turn has no summary.
pub const FALLBACK_PREVIEW_CHARS: usize = 50;

const REFERENCES_HEADER: &str = "Referenced Conversations:";
const OLDER_HEADER: &str = "Earlier Conversation (summarized):";
const CITATIONS_HEADER: &str = "Cited Excerpts:";
const RECENT_HEADER: &str = "Recent Conversation:";
const PENDING_RESPONSE: &str = "(response pending)";

/// A reference that could not be resolved when the context was built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedReference {
    pub id: String,
    #[serde(rename = "type")]
    pub ref_type: ReferenceType,
}

#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    /// Full context text; empty when there is nothing to say.
    pub text: String,
    /// The new turn's references, unchanged, for persisting on the node.
    pub references: Vec<Reference>,
    pub skipped_references: Vec<SkippedReference>,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

pub struct ContextAssembler {
    resolver: Arc<TreeResolver>,
}

impl ContextAssembler {
    pub fn new(resolver: Arc<TreeResolver>) -> Self {
        Self { resolver }
    }

    /// Assemble context for a turn about to be created under `parent_id`.
    ///
    /// A parent that is missing or owned by someone else fails the whole call
    /// with `ParentNotFound`. References that no longer resolve are skipped.
    pub fn assemble(
        &self,
        owner_id: &str,
        parent_id: Option<&str>,
        citations: &[Citation],
        references: &[Reference],
    ) -> Result<AssembledContext> {
        let chain = match parent_id {
            None => Vec::new(),
            Some(parent_id) => match self.resolver.ancestors_of(owner_id, parent_id) {
                Ok(chain) => chain,
                Err(GraphError::NotFound { id, .. }) => return Err(GraphError::ParentNotFound(id)),
                Err(e) => return Err(e),
            },
        };

        let (older, recent) = split_chain(&chain);

        let merged = dedupe_citations(
            chain
                .iter()
                .flat_map(|n| n.citations.iter())
                .chain(citations.iter())
                .cloned(),
        );

        let (reference_blocks, skipped_references) = self.resolve_references(owner_id, references)?;

        let mut sections = Vec::new();
        if !reference_blocks.is_empty() {
            sections.push(format!("{}\n{}", REFERENCES_HEADER, reference_blocks.join("\n\n")));
        }
        if !older.is_empty() {
            sections.push(format!("{}\n{}", OLDER_HEADER, render_summaries(older)));
        }
        if !merged.is_empty() {
            sections.push(format!("{}\n{}", CITATIONS_HEADER, render_citations(&merged)));
        }
        if !recent.is_empty() {
            sections.push(format!("{}\n{}", RECENT_HEADER, render_transcript(recent)));
        }

        Ok(AssembledContext {
            text: sections.join("\n\n"),
            references: references.to_vec(),
            skipped_references,
        })
    }

    fn resolve_references(
        &self,
        owner_id: &str,
        references: &[Reference],
    ) -> Result<(Vec<String>, Vec<SkippedReference>)> {
        let mut blocks = Vec::new();
        let mut skipped = Vec::new();

        for reference in references {
            let resolved = match reference.ref_type {
                ReferenceType::Chat => self.chat_block(owner_id, reference),
                ReferenceType::Folder => self.folder_blocks(owner_id, reference),
            };

            match resolved {
                Ok(Some(mut rendered)) => blocks.append(&mut rendered),
                Ok(None) => {
                    tracing::warn!(owner = %owner_id, reference = %reference.id, kind = reference.ref_type.as_str(), "skipping reference that no longer exists");
                    skipped.push(SkippedReference { id: reference.id.clone(), ref_type: reference.ref_type });
                }
                Err(e) => return Err(e),
            }
        }

        Ok((blocks, skipped))
    }

    fn chat_block(&self, owner_id: &str, reference: &Reference) -> Result<Option<Vec<String>>> {
        match self.resolver.ancestors_of(owner_id, &reference.id) {
            Ok(chain) => Ok(Some(vec![format!(
                "[Conversation {}]\n{}",
                reference.id,
                render_transcript(&chain)
            )])),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn folder_blocks(&self, owner_id: &str, reference: &Reference) -> Result<Option<Vec<String>>> {
        let db = self.resolver.db();
        let folder_ids = db.folder_subtree_ids(owner_id, &reference.id)?;
        if folder_ids.is_empty() {
            return Ok(None);
        }

        let label = reference.name.as_deref().unwrap_or(&reference.id);
        let roots = db.roots_in_folders(owner_id, &folder_ids)?;
        let blocks = roots
            .iter()
            .map(|root| {
                format!(
                    "[Folder {} / Conversation {}]\n{}",
                    label,
                    root.id,
                    render_transcript(std::slice::from_ref(root))
                )
            })
            .collect();
        Ok(Some(blocks))
    }
}

/// Split a chain into (older, recent) where `recent` holds the last
/// [`RECENT_WINDOW`] turns.
pub fn split_chain(chain: &[Node]) -> (&[Node], &[Node]) {
    let cut = chain.len().saturating_sub(RECENT_WINDOW);
    chain.split_at(cut)
}

/// One line per turn, oldest first.
pub fn render_summaries(turns: &[Node]) -> String {
    turns
        .iter()
        .map(|turn| match turn.summary.as_deref().map(str::trim) {
            Some(summary) if !summary.is_empty() => format!("- {}", summary),
            _ => format!("- User asked: {}", preview(&turn.user_prompt, FALLBACK_PREVIEW_CHARS)),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// `User:`/`AI:` pairs, oldest first.
pub fn render_transcript(turns: &[Node]) -> String {
    turns
        .iter()
        .map(|turn| {
            format!(
                "User: {}\nAI: {}",
                turn.user_prompt,
                turn.ai_response.as_deref().unwrap_or(PENDING_RESPONSE)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_citations(citations: &[Citation]) -> String {
    citations
        .iter()
        .map(|c| format!("- \"{}\" (from {})", c.text, c.source.as_str()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Deduplicate by `text`. A later entry replaces an earlier one with the same
/// text but keeps the position where that text first appeared.
pub fn dedupe_citations(citations: impl IntoIterator<Item = Citation>) -> Vec<Citation> {
    let mut merged: Vec<Citation> = Vec::new();
    let mut slots: HashMap<String, usize> = HashMap::new();

    for citation in citations {
        match slots.get(&citation.text) {
            Some(&slot) => merged[slot] = citation,
            None => {
                slots.insert(citation.text.clone(), merged.len());
                merged.push(citation);
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CitationSource, Database, NewNode};

    const OWNER: &str = "owner";

    struct Fixture {
        db: Arc<Database>,
        assembler: ContextAssembler,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::in_memory().unwrap());
        let resolver = Arc::new(TreeResolver::new(db.clone()));
        Fixture { db, assembler: ContextAssembler::new(resolver) }
    }

    fn cite(text: &str, node: &str, source: CitationSource) -> Citation {
        Citation { text: text.into(), source_node_id: node.into(), source }
    }

    fn answered(db: &Database, parent: Option<&str>, prompt: &str, response: &str, summary: Option<&str>) -> Node {
        answered_with(db, parent, prompt, response, summary, vec![])
    }

    fn answered_with(
        db: &Database,
        parent: Option<&str>,
        prompt: &str,
        response: &str,
        summary: Option<&str>,
        citations: Vec<Citation>,
    ) -> Node {
        let node = db
            .insert_node(&NewNode {
                owner_id: OWNER.into(),
                parent_id: parent.map(str::to_string),
                user_prompt: prompt.into(),
                model_metadata: serde_json::json!({}),
                citations,
                ..Default::default()
            })
            .unwrap();
        db.finalize_node(OWNER, &node.id, response, summary).unwrap();
        db.get_node(OWNER, &node.id).unwrap().unwrap()
    }

    #[test]
    fn root_turn_has_empty_context() {
        let f = fixture();
        let ctx = f.assembler.assemble(OWNER, None, &[], &[]).unwrap();
        assert!(ctx.is_empty());
    }

    #[test]
    fn missing_parent_is_parent_not_found() {
        let f = fixture();
        let err = f.assembler.assemble(OWNER, Some("ghost"), &[], &[]).unwrap_err();
        assert!(matches!(err, GraphError::ParentNotFound(ref id) if id == "ghost"));
        assert_eq!(err.kind(), "NotFound");
    }

    #[test]
    fn twelve_turn_chain_splits_ten_recent_two_older() {
        let f = fixture();
        let mut parent: Option<String> = None;
        for i in 0..12 {
            let node = answered(
                &f.db,
                parent.as_deref(),
                &format!("prompt {:02}", i),
                &format!("response {:02}", i),
                Some(&format!("summary {:02}", i)),
            );
            parent = Some(node.id);
        }

        let ctx = f.assembler.assemble(OWNER, parent.as_deref(), &[], &[]).unwrap();
        let (older, recent) = ctx.text.split_once(RECENT_HEADER).unwrap();

        assert!(older.contains("- summary 00"));
        assert!(older.contains("- summary 01"));
        assert!(!older.contains("summary 02"));
        assert!(!older.contains("prompt 00"));

        for i in 2..12 {
            assert!(recent.contains(&format!("User: prompt {:02}\nAI: response {:02}", i, i)));
        }
        assert!(!recent.contains("prompt 01"));
        assert!(!recent.contains("summary"));
    }

    #[test]
    fn older_turn_without_summary_uses_prompt_preview() {
        let f = fixture();
        let long_prompt = "x".repeat(80);
        let mut parent = Some(answered(&f.db, None, &long_prompt, "r", None).id);
        for i in 0..10 {
            parent = Some(answered(&f.db, parent.as_deref(), &format!("p{}", i), "r", None).id);
        }

        let ctx = f.assembler.assemble(OWNER, parent.as_deref(), &[], &[]).unwrap();
        let expected = format!("- User asked: {}...", "x".repeat(FALLBACK_PREVIEW_CHARS));
        assert!(ctx.text.contains(&expected));
    }

    #[test]
    fn short_chain_has_no_older_section() {
        let f = fixture();
        let a = answered(&f.db, None, "Hi", "Hello", Some("Greeting"));
        let ctx = f.assembler.assemble(OWNER, Some(&a.id), &[], &[]).unwrap();
        assert_eq!(ctx.text, format!("{}\nUser: Hi\nAI: Hello", RECENT_HEADER));
    }

    #[test]
    fn pending_response_is_marked() {
        let f = fixture();
        let a = f
            .db
            .insert_node(&NewNode {
                owner_id: OWNER.into(),
                user_prompt: "Still thinking?".into(),
                model_metadata: serde_json::json!({}),
                ..Default::default()
            })
            .unwrap();
        let ctx = f.assembler.assemble(OWNER, Some(&a.id), &[], &[]).unwrap();
        assert!(ctx.text.ends_with(PENDING_RESPONSE));
    }

    #[test]
    fn citations_dedupe_last_seen_wins() {
        let merged = dedupe_citations(vec![
            cite("same words", "n1", CitationSource::User),
            cite("other", "n1", CitationSource::User),
            cite("same words", "n2", CitationSource::Ai),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].text, "same words");
        assert_eq!(merged[0].source, CitationSource::Ai);
        assert_eq!(merged[0].source_node_id, "n2");
        assert_eq!(merged[1].text, "other");
    }

    #[test]
    fn chain_citations_merge_with_new_ones() {
        let f = fixture();
        let a = answered_with(
            &f.db,
            None,
            "Hi",
            "Hello",
            None,
            vec![cite("quoted", "x", CitationSource::User)],
        );
        let ctx = f
            .assembler
            .assemble(
                OWNER,
                Some(&a.id),
                &[cite("quoted", "y", CitationSource::Ai), cite("fresh", "y", CitationSource::Ai)],
                &[],
            )
            .unwrap();

        assert_eq!(ctx.text.matches("\"quoted\"").count(), 1);
        assert!(ctx.text.contains("- \"quoted\" (from ai)"));
        assert!(ctx.text.contains("- \"fresh\" (from ai)"));
        let quoted = ctx.text.find("\"quoted\"").unwrap();
        assert!(quoted < ctx.text.find("\"fresh\"").unwrap());
    }

    #[test]
    fn context_after_delete_reflects_the_edit() {
        let f = fixture();
        let a = answered(&f.db, None, "Root question", "Root answer", Some("Root"));
        let b = answered(&f.db, Some(&a.id), "Middle question", "Middle answer", None);
        let c = answered(&f.db, Some(&b.id), "Leaf question", "Leaf answer", None);

        let before = f.assembler.assemble(OWNER, Some(&c.id), &[], &[]).unwrap();
        assert!(before.text.contains("User: Middle question"));

        f.db.delete_single(OWNER, &b.id).unwrap();

        let after = f.assembler.assemble(OWNER, Some(&c.id), &[], &[]).unwrap();
        assert!(!after.text.contains("Middle question"));
        assert!(after.text.contains("User: Root question"));
        assert!(after.text.contains("User: Leaf question"));
        assert!(after.text.find("Root question").unwrap() < after.text.find("Leaf question").unwrap());
    }

    #[test]
    fn sections_appear_in_fixed_order() {
        let f = fixture();
        let other = answered(&f.db, None, "Other topic", "Other answer", None);
        let mut parent: Option<String> = None;
        for i in 0..11 {
            parent = Some(answered(&f.db, parent.as_deref(), &format!("p{}", i), "r", Some("s")).id);
        }

        let ctx = f
            .assembler
            .assemble(
                OWNER,
                parent.as_deref(),
                &[cite("quote", "q", CitationSource::User)],
                &[Reference { id: other.id.clone(), ref_type: ReferenceType::Chat, name: None }],
            )
            .unwrap();

        let positions: Vec<usize> = [REFERENCES_HEADER, OLDER_HEADER, CITATIONS_HEADER, RECENT_HEADER]
            .iter()
            .map(|h| ctx.text.find(h).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(ctx.text.contains(&format!("[Conversation {}]\nUser: Other topic", other.id)));
    }

    #[test]
    fn missing_references_are_skipped_and_reported() {
        let f = fixture();
        let a = answered(&f.db, None, "Hi", "Hello", None);
        let refs = vec![
            Reference { id: "gone-chat".into(), ref_type: ReferenceType::Chat, name: None },
            Reference { id: "gone-folder".into(), ref_type: ReferenceType::Folder, name: None },
        ];

        let ctx = f.assembler.assemble(OWNER, Some(&a.id), &[], &refs).unwrap();
        assert!(!ctx.text.contains(REFERENCES_HEADER));
        assert_eq!(ctx.skipped_references.len(), 2);
        assert_eq!(ctx.references, refs);
    }

    #[test]
    fn folder_reference_renders_each_root_in_nested_folders() {
        let f = fixture();
        let top = f.db.insert_folder(OWNER, "Research", None).unwrap();
        let inner = f.db.insert_folder(OWNER, "Papers", Some(&top.id)).unwrap();
        let r1 = answered(&f.db, None, "First study", "Notes one", None);
        let r2 = answered(&f.db, None, "Second study", "Notes two", None);
        f.db.set_node_placement(OWNER, &r1.id, None, Some(&top.id)).unwrap();
        f.db.set_node_placement(OWNER, &r2.id, None, Some(&inner.id)).unwrap();

        let refs = vec![Reference {
            id: top.id.clone(),
            ref_type: ReferenceType::Folder,
            name: Some("Research".into()),
        }];
        let ctx = f.assembler.assemble(OWNER, None, &[], &refs).unwrap();

        assert!(ctx.text.starts_with(REFERENCES_HEADER));
        assert!(ctx.text.contains(&format!("[Folder Research / Conversation {}]", r1.id)));
        assert!(ctx.text.contains(&format!("[Folder Research / Conversation {}]", r2.id)));
        assert!(ctx.text.contains("User: Second study\nAI: Notes two"));
        assert!(ctx.skipped_references.is_empty());
    }

    #[test]
    fn other_owners_chat_reference_is_skipped() {
        let f = fixture();
        let theirs = f
            .db
            .insert_node(&NewNode {
                owner_id: "someone-else".into(),
                user_prompt: "private".into(),
                model_metadata: serde_json::json!({}),
                ..Default::default()
            })
            .unwrap();
        let refs = vec![Reference { id: theirs.id.clone(), ref_type: ReferenceType::Chat, name: None }];

        let ctx = f.assembler.assemble(OWNER, None, &[], &refs).unwrap();
        assert!(ctx.is_empty());
        assert_eq!(ctx.skipped_references[0].id, theirs.id);
    }
}
