use crate::tool::Tool;
use crate::user::UserProfile;

use super::messages::Turn;

/// Characters kept from each recent turn when it is folded into the instruction.
const RECENT_TURN_CHARS: usize = 100;

const PERSONA: &[&str] = &[
    "You are DevTutor, a patient programming tutor who teaches by doing.",
    "- Check what the student already knows before introducing something new",
    "- Prefer small runnable examples and invite the student to try them",
    "- Split difficult ideas into short steps",
    "- Follow up with a question to confirm each step landed",
    "- Praise progress and correct mistakes kindly",
    "- Raise the difficulty as the student shows mastery",
];

/// Teaching focus for a 1-based module number, with a generic fallback.
pub fn module_guidance(module_number: usize) -> &'static str {
    match module_number {
        1 => "This is module 1, the fundamentals. Find out what the student already knows, introduce the basic syntax one piece at a time, have them run tiny examples, and probe understanding with 'what happens if' questions.",
        2 => "This is module 2, data structures. Build on module 1, show how data is organised in practice, ask the student to predict results, and have them change the structures themselves.",
        3 => "This is module 3, functions and control flow. Link back to earlier modules, teach how to define and call functions, walk through branching and loops, and have the student write their own functions.",
        4 => "This is module 4, objects and advanced concepts. Introduce modelling with types or classes, relate it to real programs, and have the student design a small component.",
        5 => "This is module 5, best practices. Cover readability, common patterns and pitfalls, have the student refactor code, and discuss trade-offs they will meet in real projects.",
        _ => "Teach interactively: ask questions, have the student practise, and confirm understanding before moving on.",
    }
}

pub struct InstructionContext<'a> {
    pub user: Option<&'a UserProfile>,
    pub tool: Option<&'a Tool>,
    /// 1-based module currently being taught.
    pub module_number: Option<usize>,
    pub history: &'a [Turn],
    pub history_window: usize,
    pub personalization: &'a [String],
}

/// Assemble the tutoring system instruction.
pub fn build_instruction(ctx: &InstructionContext<'_>) -> String {
    let mut parts: Vec<String> = PERSONA.iter().map(|s| s.to_string()).collect();

    if let Some(module_number) = ctx.module_number {
        parts.push(module_guidance(module_number).to_string());
    }

    if !ctx.history.is_empty() && ctx.history_window > 0 {
        let start = ctx.history.len().saturating_sub(ctx.history_window);
        let recent = ctx.history[start..]
            .iter()
            .map(|turn| turn.render(RECENT_TURN_CHARS))
            .collect::<Vec<_>>()
            .join(" | ");
        parts.push(format!("Recent conversation context: {recent}"));
    }

    if let Some(user) = ctx.user {
        parts.push(format!("You are speaking with {}.", user.display_name()));
        parts.extend(ctx.personalization.iter().cloned());
    }

    if let Some(tool) = ctx.tool {
        parts.push(format!(
            "The student is learning \"{}\" ({} level).",
            tool.name, tool.difficulty
        ));
        parts.push(format!("About {}: {}", tool.name, tool.description));
        if !tool.modules.is_empty() {
            let modules = tool
                .modules
                .iter()
                .enumerate()
                .map(|(i, m)| format!("{}. {}: {}", i + 1, m.title, m.description))
                .collect::<Vec<_>>()
                .join("\n");
            parts.push(format!("Ground the lessons in this curriculum:\n{modules}"));
        }
        if let Some(module) = ctx.module_number.and_then(|n| tool.module(n)) {
            parts.push(format!("The current module is \"{}\".", module.title));
        }
        parts.push(format!(
            "Keep explanations and examples specific to {} and its modules.",
            tool.name
        ));
    }

    parts.join(" ")
}
