//! Built-in fusion factories.
//!
//! Pure data: each factory's constructor returns a brand-new instruction
//! list on every call. The prompt texts are configuration, not logic — the
//! pipeline only cares about the step shapes and the recognized
//! placeholders (`{{N}}`, `{{PrevStepOutput}}`, `{{YesAnswers}}`,
//! `{{NoAnswers}}`, `{{InputText}}`).

use super::{DisplayHint, FusionFactory, Instruction, CUSTOM_FACTORY_ID};

/// Context-selection tag shared by every built-in gather step: system
/// prompt, history, user message, the N alternatives, then the step's user
/// prompt. Opaque to the pipeline; interpreted by the invoker/front-end.
const METHOD_FULL_CONTEXT: &str = "s-s0-h0-u0-aN-u";

pub(super) fn builtin_factories() -> Vec<FusionFactory> {
    vec![
        FusionFactory::builtin(
            "fuse",
            "Fuse",
            "Add Fusion",
            "Combined Response",
            "Combines the details and ideas of every reply into one clear, comprehensive answer.",
            fuse_instructions,
        ),
        FusionFactory::builtin(
            "guided",
            "Guided",
            "Add Checklist",
            "Guided Response",
            "Choose between options extracted from the replies; the model merges your selections into a single answer.",
            guided_instructions,
        ),
        FusionFactory::builtin(
            "eval",
            "Compare",
            "Add Breakdown",
            "Evaluation Table",
            "Analyzes and compares the replies in a structured table to support your choice.",
            eval_instructions,
        ),
        FusionFactory::builtin(
            "expand",
            "Expand",
            "Add Expansion",
            "Expanded Responses",
            "Pick which replies deserve more detail; the model expands the selected ones.",
            expand_instructions,
        ),
        FusionFactory::builtin(
            "rewrite",
            "Rewrite",
            "Add Rewrite",
            "Rewritten Responses",
            "Describe a target style or tone; the model rewrites and merges the replies to match.",
            rewrite_instructions,
        ),
        FusionFactory::builtin(
            "extract",
            "Extract",
            "Add Extraction",
            "Extracted Insights",
            "Extracts key facts, ideas, or arguments from the replies; pick which ones make it into the final answer.",
            extract_instructions,
        ),
        FusionFactory::builtin(
            "combine-rank",
            "Combine & Rank",
            "Add Ranked Combine",
            "Ranked Combined Response",
            "Combines every reply into one answer while ranking the originals by relevance and quality.",
            combine_rank_instructions,
        ),
        FusionFactory::builtin(
            "debate",
            "Debate",
            "Add Debate",
            "Response Debate",
            "Simulates a debate between the replies, with arguments and counter-arguments for each position.",
            debate_instructions,
        ),
        FusionFactory::builtin(
            CUSTOM_FACTORY_ID,
            "Custom",
            "Add Custom",
            "User Defined",
            "Define your own fusion prompt.",
            custom_instructions,
        ),
    ]
}

/// The reserved custom factory with user-supplied prompts: a single gather
/// step, same shape as the built-in one.
pub fn custom_with_prompts(system_prompt: String, user_prompt: String) -> FusionFactory {
    let mut factory = FusionFactory::from_instructions(
        CUSTOM_FACTORY_ID,
        "Custom",
        "Define your own fusion prompt.",
        vec![Instruction::Gather {
            label: "Executing Your Merge".to_string(),
            method: METHOD_FULL_CONTEXT.to_string(),
            system_prompt,
            user_prompt,
            display: None,
        }],
    );
    factory.add_label = "Add Custom".to_string();
    factory.card_title = "User Defined".to_string();
    factory
}

fn fuse_instructions() -> Vec<Instruction> {
    vec![Instruction::Gather {
        label: "Synthesizing Fusion".to_string(),
        method: METHOD_FULL_CONTEXT.to_string(),
        system_prompt: r#"You are an expert text synthesizer. Analyze the conversation history, the last user message, and the {{N}} response alternatives, then generate a single comprehensive response that addresses the core objectives or questions.

Integrate the most relevant insights from the alternatives into a cohesive and actionable answer."#
            .to_string(),
        user_prompt: "Synthesize the perfect cohesive response to my last message that merges the collective intelligence of the {{N}} alternatives above.".to_string(),
        display: None,
    }]
}

fn guided_instructions() -> Vec<Instruction> {
    vec![
        Instruction::Gather {
            label: "Generating Checklist".to_string(),
            method: METHOD_FULL_CONTEXT.to_string(),
            system_prompt: r#"You are analyzing {{N}} responses to the user message to identify key insights, solutions, or themes. Distill them into a clear, actionable checklist the user can select from, formatted precisely as:

- [ ] **Item name 1**: Very brief, actionable description
- [ ] **Item name 2**: Very brief, actionable description

Keep it to 3-9 orthogonal items, one brief line each, prioritizing points of difference between the alternatives."#
                .to_string(),
            user_prompt: "Given the conversation history and the {{N}} responses provided, list the key insights, themes, or solutions as distinct orthogonal options in the checklist format above.".to_string(),
            display: Some(DisplayHint::ChatMessage),
        },
        Instruction::Checklist {
            label: "Criteria Selection".to_string(),
            output_prompt: "The user selected:\n{{YesAnswers}}\n\nThe user did NOT select:\n{{NoAnswers}}".to_string(),
        },
        Instruction::Gather {
            label: "Checklist-guided Merge".to_string(),
            method: METHOD_FULL_CONTEXT.to_string(),
            system_prompt: r#"You are a master synthesizer, equipped with directions the user selected from a checklist you helped generate. Combine the {{N}} response alternatives into a single cohesive response that follows the user's chosen options and addresses the original query comprehensively."#
                .to_string(),
            user_prompt: r#"Given the user preferences below, synthesize the {{N}} response alternatives above into a single, cohesive, comprehensive response that follows the user query and the preferences below:

{{PrevStepOutput}}"#
                .to_string(),
            display: None,
        },
    ]
}

fn eval_instructions() -> Vec<Instruction> {
    vec![Instruction::Gather {
        label: "Evaluation".to_string(),
        method: METHOD_FULL_CONTEXT.to_string(),
        system_prompt: r#"You are an analytical tool that evaluates a set of responses to a user query. Identify orthogonal criteria essential for judging relevance, quality, and applicability (up to 2 for simple inputs, up to 6 for long ones), analyze each response against them, then synthesize your findings into a table."#
            .to_string(),
        user_prompt: r#"Now that you have reviewed the {{N}} alternatives:

1. **Identify Criteria** — the most important orthogonal criteria for evaluating the responses.
2. **Analyze Responses** — one brief sentence per response, noting strengths and weaknesses.
3. **Generate Table** — rows per response, columns per criterion, 1-100 scores, plus a Total column.

| Response | Criterion 1 | ... | Total |
|----------|-------------|-----|-------|
| R1 | ... | ... | ... |
| RN | ... | ... | ... |

Finally declare the best response. Only work with the provided {{N}} responses."#
            .to_string(),
        display: None,
    }]
}

fn expand_instructions() -> Vec<Instruction> {
    vec![
        Instruction::Gather {
            label: "Generating Expansion Options".to_string(),
            method: METHOD_FULL_CONTEXT.to_string(),
            system_prompt: r#"You are analyzing {{N}} responses to identify which would benefit from further elaboration or detail. Present a concise list of options formatted precisely as:

- [ ] **Response 1**: Very brief description of the response content
- [ ] **Response 2**: Very brief description of the response content"#
                .to_string(),
            user_prompt: "Given the conversation history and the {{N}} responses provided, identify which responses would benefit from expansion and list them with a very brief description of their content.".to_string(),
            display: Some(DisplayHint::ChatMessage),
        },
        Instruction::Checklist {
            label: "Response Selection".to_string(),
            output_prompt: "The user selected to expand:\n{{YesAnswers}}\n\nThe user did NOT select to expand:\n{{NoAnswers}}".to_string(),
        },
        Instruction::Gather {
            label: "Expanding Selected Responses".to_string(),
            method: METHOD_FULL_CONTEXT.to_string(),
            system_prompt: "You are a master expander, equipped with the user's directions on which responses to expand. Expand the selected responses with more detail, explanation, and elaboration while preserving the original intent and meaning.".to_string(),
            user_prompt: r#"Given the user preferences below, expand the selected responses, providing more detail and explanation while maintaining the original intent and meaning.

{{PrevStepOutput}}"#
                .to_string(),
            display: None,
        },
    ]
}

fn rewrite_instructions() -> Vec<Instruction> {
    vec![
        Instruction::FreeText {
            label: "Rewrite Instructions".to_string(),
            output_prompt: "Rewrite and merge the responses following these instructions from the user:\n{{InputText}}".to_string(),
        },
        Instruction::Gather {
            label: "Rewriting Responses".to_string(),
            method: METHOD_FULL_CONTEXT.to_string(),
            system_prompt: "You are a master rewriter. Rewrite and merge the {{N}} response alternatives, following the user's instructions precisely while maintaining the original intent and meaning.".to_string(),
            user_prompt: r#"{{PrevStepOutput}}

Produce a single rewritten response that merges the {{N}} alternatives above accordingly."#
                .to_string(),
            display: None,
        },
    ]
}

fn extract_instructions() -> Vec<Instruction> {
    vec![
        Instruction::Gather {
            label: "Extracting Key Insights".to_string(),
            method: METHOD_FULL_CONTEXT.to_string(),
            system_prompt: r#"You are analyzing a set of {{N}} responses to extract key facts, ideas, or arguments. Present a clear, concise list of extracted insights for the user to select from, formatted precisely as:

- [ ] **Insight 1**: Very brief description of the insight
- [ ] **Insight 2**: Very brief description of the insight"#
                .to_string(),
            user_prompt: "Given the conversation history and the {{N}} responses provided, extract the key facts, ideas, or arguments from the responses and list them with a very brief description.".to_string(),
            display: Some(DisplayHint::ChatMessage),
        },
        Instruction::Checklist {
            label: "Insight Selection".to_string(),
            output_prompt: "The user selected these insights:\n{{YesAnswers}}\n\nThe user did NOT select these insights:\n{{NoAnswers}}".to_string(),
        },
        Instruction::Gather {
            label: "Synthesizing Selected Insights".to_string(),
            method: METHOD_FULL_CONTEXT.to_string(),
            system_prompt: "You are a master synthesizer, equipped with specific directions from the user on which insights to include. Synthesize the selected insights into a single, coherent response that addresses the user's original query.".to_string(),
            user_prompt: r#"Given the user preferences below, synthesize the selected insights into a single, coherent response that addresses the user's original query.

{{PrevStepOutput}}"#
                .to_string(),
            display: None,
        },
    ]
}

fn combine_rank_instructions() -> Vec<Instruction> {
    vec![Instruction::Gather {
        label: "Combining and Ranking Responses".to_string(),
        method: METHOD_FULL_CONTEXT.to_string(),
        system_prompt: r#"You are combining a set of {{N}} responses into a single response while ranking the individual responses by their relevance and quality. Format the result precisely as:

**Combined Response:**

[Combined response content, integrating all responses]

**Response Rankings:**

1. **Response [number]**: Very brief reason for its top ranking
2. **Response [number]**: Very brief reason for its ranking"#
            .to_string(),
        user_prompt: "Given the conversation history and the {{N}} responses provided, combine all responses into a single response while ranking the individual responses by their relevance and quality.".to_string(),
        display: None,
    }]
}

fn debate_instructions() -> Vec<Instruction> {
    vec![Instruction::Gather {
        label: "Simulating a Debate".to_string(),
        method: METHOD_FULL_CONTEXT.to_string(),
        system_prompt: r#"You are simulating a debate between {{N}} responses to the user's query: a structured exchange where each response advocates for its position and critiques the others. Format it precisely as:

**Debate:**

**Response 1 Argument:** [Response 1 presents its main argument or point]
**Response 2 Counter-Argument:** [Response 2 critiques Response 1's point]
**Response 3 Argument:** [Response 3 presents its main argument or point]
**Response 1 Counter-Argument:** [Response 1 critiques Response 3's point]

Continue until each response has presented its argument and critiqued the others, then conclude with a summary of the key points raised by each response."#
            .to_string(),
        user_prompt: "Given the conversation history and the {{N}} responses provided, simulate a debate between the responses, allowing each to present its argument and critique the others.".to_string(),
        display: None,
    }]
}

fn custom_instructions() -> Vec<Instruction> {
    vec![Instruction::Gather {
        label: "Executing Your Merge".to_string(),
        method: METHOD_FULL_CONTEXT.to_string(),
        system_prompt: r#"Synthesize a cohesive and relevant response based on the original system message, the conversation history, the user query, and a set of {{N}} independently generated answers presented in random order. Integrate their insights into a single coherent response aligned with the conversation's context and objectives."#
            .to_string(),
        user_prompt: "Based on the {{N}} alternatives provided, synthesize a single, comprehensive response.".to_string(),
        display: None,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::UserInputKind;

    #[test]
    fn test_builtin_shapes() {
        for factory in builtin_factories() {
            let instructions = factory.instantiate();
            assert!(!instructions.is_empty(), "{} is empty", factory.factory_id);
            // Every built-in ends with an automated step so the run can
            // complete without trailing user input.
            assert!(instructions
                .last()
                .map(|i| i.user_input_kind().is_none())
                .unwrap_or(false));
        }
    }

    #[test]
    fn test_guided_is_gather_checklist_gather() {
        let steps = guided_instructions();
        assert_eq!(steps.len(), 3);
        assert!(steps[0].user_input_kind().is_none());
        assert_eq!(steps[1].user_input_kind(), Some(UserInputKind::Checklist));
        assert!(steps[2].user_input_kind().is_none());
    }

    #[test]
    fn test_rewrite_leads_with_free_text() {
        let steps = rewrite_instructions();
        assert_eq!(steps[0].user_input_kind(), Some(UserInputKind::FreeText));
    }

    #[test]
    fn test_extract_is_gather_checklist_gather() {
        let steps = extract_instructions();
        assert_eq!(steps.len(), 3);
        assert!(steps[0].user_input_kind().is_none());
        assert_eq!(steps[1].user_input_kind(), Some(UserInputKind::Checklist));
        assert!(steps[2].user_input_kind().is_none());
    }

    #[test]
    fn test_catalog_carries_all_builtins() {
        let ids: Vec<String> = builtin_factories()
            .into_iter()
            .map(|f| f.factory_id)
            .collect();
        for id in [
            "fuse",
            "guided",
            "eval",
            "expand",
            "rewrite",
            "extract",
            "combine-rank",
            "debate",
            CUSTOM_FACTORY_ID,
        ] {
            assert!(ids.contains(&id.to_string()), "missing {}", id);
        }
    }

    #[test]
    fn test_single_step_rank_and_debate_need_no_input() {
        for steps in [combine_rank_instructions(), debate_instructions()] {
            assert_eq!(steps.len(), 1);
            assert!(steps[0].user_input_kind().is_none());
        }
    }
}
