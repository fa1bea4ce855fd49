//! Prompt text and chat-message builders for the LLM-backed oracles.

use webmcts_core::{ChatMessage, PolicyRequest, ReflectionRequest, RewardRequest};

pub use webmcts_core::action::ANSWER_PHRASE;

pub const POLICY_INTRO: &str = r#"You are an autonomous agent operating a web browser to accomplish a user objective, one action at a time.

## Inputs
- OBJECTIVE: the task to accomplish.
- TRAJECTORY: earlier steps (observation, reasoning, action), each wrapped in <step-N></step-N> tags.
- OBSERVATION: the current page as an accessibility tree. Lines look like `[id] role name`.
  Interactive roles: img, link, button, spinbutton, searchbox, checkbox, combobox, menu, menubar, menuitem, menuitemcheckbox, menuitemradio, textbox.
  Other roles (StaticText, heading, ...) can be read but not manipulated.

## Actions
- click [id]: click an interactive element.
- type [id] [content] [0|1]: type into a textbox or searchbox; 1 presses Enter afterwards, 0 does not.
- hover [id]: move the pointer over an element.
- scroll [down] or scroll [up]: reveal more of the page.
- goto [url]: open a URL.
- go_back: return to the previous page.
- stop [answer]: finish the task. Use `stop [N/A]` when the task cannot be done.

## Rules
1. Only act on elements that exist in the current observation.
2. Prefer precise search terms over vague ones.
3. When the page holds nothing useful, navigate elsewhere or go back.
4. Check the trajectory before issuing `stop`.

## Response format
Start with "Let's think step-by-step." followed by your reasoning, then end with
"In summary, the next action I will perform is ```<action>```". Emit exactly one action."#;

const POLICY_EXAMPLES: [(&str, &str); 2] = [
    (
        "OBJECTIVE:\nWhat is the price of HP Inkjet Fax Machine\n\nTRAJECTORY:\n\n\nOBSERVATION:\n\t[1744] link 'HP CB782A#ABA 640 Inkjet Fax Machine (Renewed)'\n\t\t[1749] StaticText '$279.49'\n\t\t[1757] button 'Add to Cart'\n\nWhat's the next action?",
        "Let's think step-by-step. The product link is shown together with a StaticText holding its price, $279.49. That answers the objective directly. In summary, the next action I will perform is ```stop [$279.49]```",
    ),
    (
        "OBJECTIVE:\nShow me the restaurants near CMU\n\nTRAJECTORY:\n\n\nOBSERVATION:\n\t[164] textbox 'Search' focused: True required: False\n\t[171] button 'Go'\n\t[212] heading 'Search Results'\n\nWhat's the next action?",
        "Let's think step-by-step. Textbox [164] accepts a search query. Typing 'restaurants near CMU' and pressing Enter submits it. In summary, the next action I will perform is ```type [164] [restaurants near CMU] [1]```",
    ),
];

/// The user turn of a policy prompt.
pub fn policy_input(objective: &str, trajectory: &str, observation: &str) -> String {
    format!(
        "OBJECTIVE:\n{objective}\n\nTRAJECTORY:\n{trajectory}\n\nOBSERVATION:\n{observation}\n\nWhat's the next action?"
    )
}

pub fn policy_messages(req: &PolicyRequest) -> Vec<ChatMessage> {
    let mut out = vec![ChatMessage::system(POLICY_INTRO)];
    for (input, output) in POLICY_EXAMPLES {
        out.push(ChatMessage::named_system("example_user", input));
        out.push(ChatMessage::named_system("example_assistant", output));
    }
    out.push(ChatMessage::user(policy_input(
        &req.intent,
        &req.trace,
        &req.observation,
    )));
    out
}

const WORLD_INTRO: &str = r#"You are a web state prediction engine. Given the CURRENT page (accessibility tree) and an action that was just EXECUTED on it, predict the NEXT page observation.

Actions: click [id], type [id] [content] [0|1], hover [id], scroll [up|down], goto [url], go_back, stop [answer] (no state change).

Guidelines:
1. Keep the ids of elements that do not change.
2. Reflect typed text in the affected input field.
3. Add or remove elements as the action implies (new results, scrolled content, opened menus).
4. For goto/go_back, produce a page that fits the destination.

Output the complete predicted accessibility tree, indentation preserved, inside <a11y></a11y>."#;

pub fn world_messages(state: &str, action: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(WORLD_INTRO),
        ChatMessage::user(format!(
            "Current web page observation:\n```{state}```\n\nExecuted action:\n{action}\n\nPredict the next web page observation:\n"
        )),
    ]
}

const REWARD_INTRO: &str = r#"You evaluate trajectories of a GUI agent working in a web browser.
A trajectory has the user instruction, the agent's reasoning and action for every step, and the accessibility tree of the latest page.

Judge:
1. Coherence: do the steps move logically toward the goal, without redundant actions?
2. Completion: is the task achieved and concluded with a 'stop' action?

Score from 1 to 5:
- 5: completed with 'stop', correct answer, no redundancy.
- 4: mostly completed with 'stop', minor inefficiency or ambiguity.
- 3: partial progress, no 'stop' or goal not fully reached.
- 2: few useful actions, early deviation or repetition.
- 1: no meaningful progress, deadlock or loop.

Reply in exactly two lines:
Reason: <your reasoning>
Score: <1-5>"#;

pub fn reward_messages(req: &RewardRequest) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(REWARD_INTRO),
        ChatMessage::user(format!(
            "** High-level Instruction **:{}\n** Action History **:\n- Reasoning and Action for Each Step:\n{}\nThe current web page's accessibility tree of the last state:\n{}\n\n** Your Response **:",
            req.intent, req.trace, req.state
        )),
    ]
}

const JUDGE_INTRO: &str = r#"You compare two short texts and decide whether they mean the same thing.
Ignore wording, synonyms, ordering, typos, formatting and punctuation. Focus on the core fact or intent.
Answer with JSON only:
{"similarity_binary": "<yes|no>", "similarity_score": "<0.00-1.00>", "analysis": "<one sentence>"}"#;

const JUDGE_EXAMPLES: [(&str, &str, &str); 4] = [
    (
        "Carnegie Mellon University",
        "Carnegie Mellon University, NYC",
        r#"{"similarity_binary": "yes", "similarity_score": "0.95", "analysis": "Both name the same institution; B adds a location."}"#,
    ),
    (
        "x-lab",
        "groups/x-lab",
        r#"{"similarity_binary": "yes", "similarity_score": "0.75", "analysis": "Same name; B adds a namespace prefix."}"#,
    ),
    (
        "Public",
        "crew",
        r#"{"similarity_binary": "no", "similarity_score": "0.0", "analysis": "Unrelated words."}"#,
    ),
    (
        "Product-A: $20, Product-B: $18",
        "A: $20, B: $18",
        r#"{"similarity_binary": "yes", "similarity_score": "0.65", "analysis": "Same prices, B is terser."}"#,
    ),
];

fn judge_input(a: &str, b: &str) -> String {
    format!("- Text A: {a}\n- Text B: {b}")
}

pub fn judge_messages(a: &str, b: &str) -> Vec<ChatMessage> {
    let mut system = format!("{JUDGE_INTRO}\nExamples:");
    for (x, y, out) in JUDGE_EXAMPLES {
        system.push_str(&format!("\nQ: {}\nA: {out}", judge_input(x, y)));
    }
    vec![ChatMessage::system(system), ChatMessage::user(judge_input(a, b))]
}

const REFLECTION_INTRO: &str = r#"You help a web agent recover from a mistake.
You get the objective, the action the agent took, the page before that action, and the page it led to.
Explain briefly, starting with "Let's think step-by-step.", why the action did not help the objective and why the agent should go back to the previous page.
Do not propose any action other than going back."#;

pub fn reflection_messages(req: &ReflectionRequest) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(REFLECTION_INTRO),
        ChatMessage::user(format!(
            "OBJECTIVE:\n{}\n\nACTION TAKEN:\n{}\n\nPREVIOUS PAGE:\n{}\n\nCURRENT PAGE:\n{}",
            req.intent, req.failed_action, req.last_state, req.current_state
        )),
    ]
}
