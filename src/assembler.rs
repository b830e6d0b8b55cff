//! Context Assembler — builds the prompt materials for one turn.
//!
//! Produces a single system instruction (strategy block + optional
//! knowledge block + optional memory block), the generation settings, and
//! the tools flag, all governed by the workspace's budget tier.
//!
//! Assembly is deterministic: identical inputs always produce identical
//! outputs. No randomness or wall-clock reads happen here.

use crate::crm::{BudgetTier, LeadMemory, StrategyVersion, Workspace};
use crate::knowledge::KnowledgeDoc;
use crate::llm::GenerationSettings;

/// Maximum knowledge snippets packed into one prompt.
const MAX_SNIPPETS: usize = 3;

/// Character budget per packed snippet.
const SNIPPET_CHAR_BUDGET: usize = 1000;

/// Fallback system prompt when a workspace has no Active strategy.
const DEFAULT_STRATEGY_PROMPT: &str = "You are a helpful outbound sales-qualification assistant. \
     Be brief, professional, and honest. Ask one qualifying question at a time \
     and never pressure the lead.";

/// Everything the assembler consumes for one turn.
pub struct AssemblerInput<'a> {
    pub workspace: &'a Workspace,
    pub strategy: Option<&'a StrategyVersion>,
    pub memory: Option<&'a LeadMemory>,
    /// Knowledge candidates in retrieval order, already tenant-scoped.
    pub knowledge: &'a [KnowledgeDoc],
    /// Most recent inbound text, used for snippet ranking.
    pub query: Option<&'a str>,
}

/// The assembled prompt materials and provider settings.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub system_instruction: String,
    pub settings: GenerationSettings,
    pub tools_enabled: bool,
}

/// Per-tier context policy, applied identically on every call.
fn tier_settings(tier: BudgetTier) -> (GenerationSettings, bool) {
    match tier {
        BudgetTier::Red => (
            GenerationSettings {
                max_tokens: 512,
                temperature: 0.5,
            },
            false,
        ),
        BudgetTier::Yellow => (
            GenerationSettings {
                max_tokens: 1024,
                temperature: 0.7,
            },
            true,
        ),
        BudgetTier::Green => (
            GenerationSettings {
                max_tokens: 2048,
                temperature: 0.7,
            },
            true,
        ),
    }
}

/// Build the prompt context for one turn.
pub fn assemble(input: &AssemblerInput<'_>) -> AssembledContext {
    let tier = input.workspace.budget_tier;
    let (settings, tools_enabled) = tier_settings(tier);

    let mut sections: Vec<String> = vec![strategy_block(input.strategy)];

    if tier != BudgetTier::Red {
        if let Some(query) = input.query
            && let Some(block) = knowledge_block(input.knowledge, query)
        {
            sections.push(block);
        }

        if let Some(memory) = input.memory
            && let Some(block) = memory_block(memory, tier)
        {
            sections.push(block);
        }
    }

    AssembledContext {
        system_instruction: sections.join("\n\n"),
        settings,
        tools_enabled,
    }
}

fn strategy_block(strategy: Option<&StrategyVersion>) -> String {
    let Some(strategy) = strategy else {
        return DEFAULT_STRATEGY_PROMPT.to_string();
    };

    let mut block = String::from("## Conversation strategy\n");
    if !strategy.tone.is_empty() {
        block.push_str(&format!("Tone: {}\n", strategy.tone));
    }
    if !strategy.objectives.is_empty() {
        block.push_str(&format!("Objectives: {}\n", strategy.objectives));
    }
    if !strategy.objection_handling.is_empty() {
        block.push_str(&format!(
            "Objection handling: {}\n",
            strategy.objection_handling
        ));
    }
    if !strategy.call_to_action.is_empty() {
        block.push_str(&format!("Call to action: {}\n", strategy.call_to_action));
    }
    block.trim_end().to_string()
}

/// Rank docs by keyword overlap with the query and pack the top snippets.
///
/// Score = matched query words / total query words. Ties keep retrieval
/// order (stable sort). Zero-overlap docs are dropped.
fn knowledge_block(docs: &[KnowledgeDoc], query: &str) -> Option<String> {
    let query_words: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if query_words.is_empty() || docs.is_empty() {
        return None;
    }

    let mut scored: Vec<(f64, &KnowledgeDoc)> = docs
        .iter()
        .filter_map(|doc| {
            let haystack = doc.content.to_lowercase();
            let doc_words: std::collections::HashSet<&str> =
                haystack.split_whitespace().collect();
            let matched = query_words
                .iter()
                .filter(|w| doc_words.contains(w.as_str()))
                .count();
            if matched == 0 {
                None
            } else {
                Some((matched as f64 / query_words.len() as f64, doc))
            }
        })
        .collect();

    if scored.is_empty() {
        return None;
    }

    // Stable sort keeps retrieval order for equal scores.
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut block = String::from("## Relevant knowledge\n");
    for (_, doc) in scored.iter().take(MAX_SNIPPETS) {
        let snippet = clip_chars(&doc.content, SNIPPET_CHAR_BUDGET);
        block.push_str(&format!("- {}: {}\n", doc.title, snippet));
    }
    Some(block.trim_end().to_string())
}

fn memory_block(memory: &LeadMemory, tier: BudgetTier) -> Option<String> {
    if memory.summary.is_empty() && memory.facts.is_empty() {
        return None;
    }

    let mut block = String::from("## Lead memory\n");
    if !memory.summary.is_empty() {
        block.push_str(&memory.summary);
        block.push('\n');
    }

    // Yellow carries the summary only; facts are a Green-tier privilege.
    if tier == BudgetTier::Green && !memory.facts.is_empty() {
        block.push_str("Known facts:\n");
        for fact in &memory.facts {
            block.push_str(&format!("- {fact}\n"));
        }
    }
    Some(block.trim_end().to_string())
}

/// Truncate to at most `budget` characters on a char boundary.
fn clip_chars(s: &str, budget: usize) -> &str {
    match s.char_indices().nth(budget) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn workspace(tier: BudgetTier) -> Workspace {
        let mut ws = Workspace::new("Acme", "agent-1");
        ws.budget_tier = tier;
        ws
    }

    fn strategy(workspace_id: Uuid) -> StrategyVersion {
        let now = Utc::now();
        StrategyVersion {
            id: Uuid::new_v4(),
            workspace_id,
            version: 1,
            status: crate::crm::StrategyStatus::Active,
            tone: "warm".into(),
            objectives: "qualify budget".into(),
            objection_handling: "acknowledge first".into(),
            call_to_action: "book a call".into(),
            created_at: now,
            updated_at: now,
        }
    }

    fn memory(lead_id: Uuid) -> LeadMemory {
        LeadMemory {
            lead_id,
            summary: "Interested but busy until Q4.".into(),
            facts: vec!["uses a competitor".into(), "team of 12".into()],
            last_updated_at: Utc::now(),
        }
    }

    fn doc(title: &str, content: &str) -> KnowledgeDoc {
        KnowledgeDoc {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            agent_id: "agent-1".into(),
            title: title.into(),
            content: content.into(),
        }
    }

    #[test]
    fn red_tier_excludes_knowledge_and_memory() {
        let ws = workspace(BudgetTier::Red);
        let strat = strategy(ws.id);
        let mem = memory(Uuid::new_v4());
        let docs = vec![doc("pricing", "pricing details for plans")];

        let ctx = assemble(&AssemblerInput {
            workspace: &ws,
            strategy: Some(&strat),
            memory: Some(&mem),
            knowledge: &docs,
            query: Some("pricing"),
        });

        assert_eq!(ctx.settings.max_tokens, 512);
        assert!((ctx.settings.temperature - 0.5).abs() < f32::EPSILON);
        assert!(!ctx.tools_enabled);
        assert!(!ctx.system_instruction.contains("Relevant knowledge"));
        assert!(!ctx.system_instruction.contains("Lead memory"));
        assert!(ctx.system_instruction.contains("Conversation strategy"));
    }

    #[test]
    fn yellow_tier_includes_summary_but_not_facts() {
        let ws = workspace(BudgetTier::Yellow);
        let mem = memory(Uuid::new_v4());

        let ctx = assemble(&AssemblerInput {
            workspace: &ws,
            strategy: None,
            memory: Some(&mem),
            knowledge: &[],
            query: None,
        });

        assert_eq!(ctx.settings.max_tokens, 1024);
        assert!(ctx.tools_enabled);
        assert!(ctx.system_instruction.contains("Interested but busy"));
        assert!(!ctx.system_instruction.contains("uses a competitor"));
    }

    #[test]
    fn green_tier_includes_full_memory() {
        let ws = workspace(BudgetTier::Green);
        let mem = memory(Uuid::new_v4());

        let ctx = assemble(&AssemblerInput {
            workspace: &ws,
            strategy: None,
            memory: Some(&mem),
            knowledge: &[],
            query: None,
        });

        assert_eq!(ctx.settings.max_tokens, 2048);
        assert!(ctx.system_instruction.contains("uses a competitor"));
        assert!(ctx.system_instruction.contains("team of 12"));
    }

    #[test]
    fn missing_strategy_falls_back_to_default_prompt() {
        let ws = workspace(BudgetTier::Green);
        let ctx = assemble(&AssemblerInput {
            workspace: &ws,
            strategy: None,
            memory: None,
            knowledge: &[],
            query: None,
        });
        assert!(ctx.system_instruction.contains("sales-qualification assistant"));
    }

    #[test]
    fn knowledge_requires_a_query() {
        let ws = workspace(BudgetTier::Green);
        let docs = vec![doc("pricing", "pricing details")];
        let ctx = assemble(&AssemblerInput {
            workspace: &ws,
            strategy: None,
            memory: None,
            knowledge: &docs,
            query: None,
        });
        assert!(!ctx.system_instruction.contains("Relevant knowledge"));
    }

    #[test]
    fn knowledge_ranked_by_overlap_top_three() {
        let ws = workspace(BudgetTier::Green);
        let docs = vec![
            doc("weak", "only pricing mentioned here"),
            doc("strong", "pricing plans for enterprise teams"),
            doc("none", "completely unrelated content"),
            doc("medium", "enterprise pricing overview"),
            doc("also-weak", "pricing again"),
        ];

        let ctx = assemble(&AssemblerInput {
            workspace: &ws,
            strategy: None,
            memory: None,
            knowledge: &docs,
            query: Some("pricing plans for enterprise"),
        });

        let instruction = &ctx.system_instruction;
        assert!(instruction.contains("strong"));
        assert!(instruction.contains("medium"));
        assert!(!instruction.contains("none"));
        // "strong" matches 4/4 words, "medium" 2/4, the weak docs 1/4; only
        // three snippets are packed so one weak doc must be dropped.
        let packed = instruction.matches("- ").count();
        assert_eq!(packed, 3);
        // Highest score comes first.
        let strong_pos = instruction.find("strong").unwrap();
        let medium_pos = instruction.find("medium").unwrap();
        assert!(strong_pos < medium_pos);
    }

    #[test]
    fn knowledge_ties_keep_retrieval_order() {
        let ws = workspace(BudgetTier::Green);
        let docs = vec![
            doc("first", "pricing info a"),
            doc("second", "pricing info b"),
        ];

        let ctx = assemble(&AssemblerInput {
            workspace: &ws,
            strategy: None,
            memory: None,
            knowledge: &docs,
            query: Some("pricing"),
        });

        let first_pos = ctx.system_instruction.find("first").unwrap();
        let second_pos = ctx.system_instruction.find("second").unwrap();
        assert!(first_pos < second_pos);
    }

    #[test]
    fn snippets_clipped_to_char_budget() {
        let ws = workspace(BudgetTier::Green);
        let long = format!("pricing {}", "x".repeat(5000));
        let docs = vec![doc("long", &long)];

        let ctx = assemble(&AssemblerInput {
            workspace: &ws,
            strategy: None,
            memory: None,
            knowledge: &docs,
            query: Some("pricing"),
        });

        // The packed snippet line must not carry the full 5000 chars.
        let line = ctx
            .system_instruction
            .lines()
            .find(|l| l.starts_with("- long:"))
            .unwrap();
        assert!(line.len() <= SNIPPET_CHAR_BUDGET + "- long: ".len());
    }

    #[test]
    fn clip_chars_respects_boundaries() {
        assert_eq!(clip_chars("hello", 10), "hello");
        assert_eq!(clip_chars("hello", 3), "hel");
        // Multi-byte chars must not be split.
        assert_eq!(clip_chars("héllo", 2), "hé");
    }

    #[test]
    fn assembly_is_deterministic() {
        let ws = workspace(BudgetTier::Green);
        let strat = strategy(ws.id);
        let mem = memory(Uuid::new_v4());
        let docs = vec![
            doc("a", "pricing plans"),
            doc("b", "enterprise pricing"),
        ];
        let input = AssemblerInput {
            workspace: &ws,
            strategy: Some(&strat),
            memory: Some(&mem),
            knowledge: &docs,
            query: Some("pricing plans"),
        };

        let first = assemble(&input);
        let second = assemble(&input);
        assert_eq!(first.system_instruction, second.system_instruction);
        assert_eq!(first.settings, second.settings);
        assert_eq!(first.tools_enabled, second.tools_enabled);
    }
}
