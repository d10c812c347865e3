//! Default prompt content for each agent role, phase templates, and the
//! resolver that reads overrides from the template registry.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever default content
//! changes, so a stored response can be traced to the prompt that
//! produced it. Published registry versions carry their own lineage.

use std::sync::Arc;

use deliberation::{schema_hint, AgentId, PromptRegistry, PromptType, RunPhase};

/// Default prompt version. Bump on any default content change.
pub const PROMPT_VERSION: &str = "1.2.0";

/// Logical Analyst preamble.
pub const ANALYST_PREAMBLE: &str = "\
You are the Logical Analyst on a deliberation panel. You decompose the task \
into premises and inferences, reason step by step, and state exactly how \
confident you are and why.

## Rules
- Separate facts from assumptions; list every assumption you rely on.
- Name the risks that would most change your conclusion.
- Report confidence honestly; 0.5 means genuinely unsure.
";

/// Systems Architect preamble. Doubles as the default synthesizer.
pub const ARCHITECT_PREAMBLE: &str = "\
You are the Systems Architect on a deliberation panel. You look at the task \
as a system: components, interfaces, feedback loops, second-order effects, \
and failure modes.

## Rules
- Surface structural dependencies the other roles are likely to miss.
- Prefer designs that degrade gracefully over optimal-but-brittle ones.
- When synthesizing, weigh every panelist's analysis and the critiques \
  against each other; never simply average positions.
";

/// Alternatives Generator preamble.
pub const EXPLORER_PREAMBLE: &str = "\
You are the Alternatives Generator on a deliberation panel. Your job is \
breadth: lay out the options everyone else anchored away from, including \
uncomfortable ones.

## Rules
- Always present at least one alternative to the obvious path.
- Say what would have to be true for each alternative to win.
- Do not converge early; your value is the spread of options.
";

/// Formal Analyst preamble.
pub const FORMALIST_PREAMBLE: &str = "\
You are the Formal Analyst on a deliberation panel. You quantify: expected \
values, bounds, base rates, and falsifiable claims.

## Rules
- Put numbers or explicit ranges on claims wherever possible.
- Flag any claim that cannot be falsified as such.
- Keep the analysis terse; precision over prose.
";

/// Analyze-phase user prompt. `{refinement}` is empty on the first
/// iteration and carries the previous synthesis plus critiques of this
/// agent on refinement passes.
pub const ANALYZE_TEMPLATE: &str = "\
# Task ({task_type})
{task}
{context}{refinement}
Produce your independent analysis of the task from your role's perspective.

Reply with strict JSON only, matching this schema:
{schema}
";

/// Refinement context block appended into `{refinement}`.
pub const REFINEMENT_BLOCK: &str = "
## Previous synthesis
{previous_synthesis}

## Critiques of your last analysis
{critiques_of_self}

Refine your analysis: address the critiques directly, keep what survived \
them, and update your confidence.
";

/// Critique-phase user prompt. All analyses are shown; the target's is
/// marked so the critic reviews it in context.
pub const CRITIQUE_TEMPLATE: &str = "\
# Task ({task_type})
{task}

## Panel analyses (critique the one marked TARGET, from {target_agent})
{other_analyses}

Score the TARGET analysis on [0, 10] and critique it adversarially: what is \
weak, missing, or wrong, and what genuinely holds up.

Reply with strict JSON only, matching this schema:
{schema}
";

/// Synthesize-phase user prompt.
pub const SYNTHESIS_TEMPLATE: &str = "\
# Task ({task_type})
{task}

## Panel analyses (iteration {iteration})
{other_analyses}

## Critiques
{critiques}

Fold the panel's positions into one answer: a summary, probabilistic \
conclusions (with falsification conditions where you can name them), \
recommendations, and a consensus_level in [0, 1] measuring how much the \
panel actually agrees after critique.

Reply with strict JSON only, matching this schema:
{schema}
";

/// Suffix appended when the first parse attempt fails.
pub const STRICT_JSON_SUFFIX: &str = "\n\nYour previous reply was not valid \
JSON. Reply again with ONLY a JSON object matching the schema — no prose, \
no markdown fences.";

/// Default preamble for an agent role.
pub fn default_preamble(agent: AgentId) -> &'static str {
    match agent {
        AgentId::Analyst => ANALYST_PREAMBLE,
        AgentId::Architect => ARCHITECT_PREAMBLE,
        AgentId::Explorer => EXPLORER_PREAMBLE,
        AgentId::Formalist => FORMALIST_PREAMBLE,
    }
}

/// Default template for a phase.
pub fn default_template(phase: RunPhase) -> &'static str {
    match phase {
        RunPhase::Analyze => ANALYZE_TEMPLATE,
        RunPhase::Critique => CRITIQUE_TEMPLATE,
        RunPhase::Synthesize => SYNTHESIS_TEMPLATE,
    }
}

fn prompt_type_for(phase: RunPhase) -> PromptType {
    match phase {
        RunPhase::Analyze => PromptType::UserTemplate,
        RunPhase::Critique => PromptType::Critique,
        RunPhase::Synthesize => PromptType::Synthesis,
    }
}

/// Replace `{key}` placeholders with values. Unknown placeholders are left
/// intact so a malformed custom template fails loudly in review rather
/// than silently dropping content.
pub fn interpolate(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// Resolves the effective prompt for an agent and phase: active registry
/// template if one exists, built-in default otherwise.
pub struct PromptResolver {
    registry: Arc<PromptRegistry>,
}

impl PromptResolver {
    pub fn new(registry: Arc<PromptRegistry>) -> Self {
        Self { registry }
    }

    /// The registry backing this resolver.
    pub fn registry(&self) -> &Arc<PromptRegistry> {
        &self.registry
    }

    /// System preamble for an agent.
    pub fn system_prompt(&self, agent: AgentId) -> String {
        self.registry
            .active(agent, PromptType::System)
            .map(|t| t.content)
            .unwrap_or_else(|| default_preamble(agent).to_string())
    }

    /// Phase template for an agent, with the schema hint pre-interpolated.
    pub fn phase_template(&self, agent: AgentId, phase: RunPhase) -> String {
        let raw = self
            .registry
            .active(agent, prompt_type_for(phase))
            .map(|t| t.content)
            .unwrap_or_else(|| default_template(phase).to_string());
        interpolate(&raw, &[("schema", schema_hint(phase))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolation_replaces_known_keys() {
        let out = interpolate("task: {task} ({task_type})", &[
            ("task", "enter market"),
            ("task_type", "strategy"),
        ]);
        assert_eq!(out, "task: enter market (strategy)");
    }

    #[test]
    fn interpolation_leaves_unknown_keys() {
        let out = interpolate("{task} {mystery}", &[("task", "x")]);
        assert_eq!(out, "x {mystery}");
    }

    #[test]
    fn resolver_falls_back_to_defaults() {
        let resolver = PromptResolver::new(Arc::new(PromptRegistry::new()));
        assert_eq!(
            resolver.system_prompt(AgentId::Analyst),
            ANALYST_PREAMBLE
        );
        let template = resolver.phase_template(AgentId::Analyst, RunPhase::Analyze);
        assert!(template.contains("\"analysis\""));
        assert!(!template.contains("{schema}"));
    }

    #[test]
    fn resolver_prefers_active_registry_template() {
        let registry = Arc::new(PromptRegistry::new());
        registry
            .publish(AgentId::Explorer, PromptType::System, "custom preamble")
            .unwrap();
        let resolver = PromptResolver::new(registry);
        assert_eq!(resolver.system_prompt(AgentId::Explorer), "custom preamble");
        // Other agents still get defaults.
        assert_eq!(
            resolver.system_prompt(AgentId::Formalist),
            FORMALIST_PREAMBLE
        );
    }

    #[test]
    fn phase_templates_carry_their_schema() {
        let resolver = PromptResolver::new(Arc::new(PromptRegistry::new()));
        let critique = resolver.phase_template(AgentId::Analyst, RunPhase::Critique);
        assert!(critique.contains("\"score\""));
        let synthesis = resolver.phase_template(AgentId::Architect, RunPhase::Synthesize);
        assert!(synthesis.contains("consensus_level"));
    }

    #[test]
    fn every_agent_has_a_distinct_preamble() {
        let preambles: Vec<&str> = AgentId::ALL.iter().map(|a| default_preamble(*a)).collect();
        for (i, a) in preambles.iter().enumerate() {
            for b in preambles.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
