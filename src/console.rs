use std::io::{self, BufRead, Write};

use agent_broker::runner::{InteractionLaunch, InteractionSurface};
use agent_broker::types::AgentPayload;

/// Presents interactions as a y/N prompt on the terminal.
///
/// Confirming hands the descriptor's data back to the agent unchanged.
#[derive(Debug, Default)]
pub struct ConsoleSurface;

impl ConsoleSurface {
    pub fn new() -> Self {
        Self
    }
}

impl InteractionSurface for ConsoleSurface {
    fn launch(&self, launch: InteractionLaunch) {
        std::thread::spawn(move || prompt(launch));
    }
}

fn prompt(launch: InteractionLaunch) {
    let descriptor = &launch.descriptor;
    let title = if descriptor.title.is_empty() {
        "Agent requires confirmation"
    } else {
        descriptor.title.as_str()
    };

    let mut stderr = io::stderr().lock();
    let _ = writeln!(stderr, "[{}] {}", launch.agent, title);
    if !descriptor.message.is_empty() {
        let _ = writeln!(stderr, "{}", descriptor.message);
    }
    let _ = write!(stderr, "Continue? [y/N] ");
    let _ = stderr.flush();
    drop(stderr);

    let mut answer = String::new();
    if let Err(error) = io::stdin().lock().read_line(&mut answer) {
        launch.fail(format!("failed to read answer: {error}"));
        return;
    }

    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => {
            let result = AgentPayload {
                action: String::new(),
                extras: launch.descriptor.data.clone(),
            };
            launch.complete(result);
        }
        _ => launch.cancel(),
    }
}
