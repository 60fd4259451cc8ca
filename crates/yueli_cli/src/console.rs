//! Terminal commands.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Quit,
    /// Print the operator counters as JSON.
    Stats,
    /// Reload the action catalog from disk.
    Reload,
    /// Print the session's current emotion.
    Emotion,
    /// End the terminal session and start a fresh one.
    Reset,
    /// `/act <tag>`: decide on an explicit intent tag.
    Act(String),
    /// Anything else is something the avatar says.
    Say(String),
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        match line {
            "" => Command::Empty,
            "quit" | "exit" => Command::Quit,
            "stats" => Command::Stats,
            "reload" => Command::Reload,
            "emotion" => Command::Emotion,
            "reset" => Command::Reset,
            _ => match line.strip_prefix("/act") {
                Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => {
                    let tag = rest.trim();
                    if tag.is_empty() {
                        Command::Empty
                    } else {
                        Command::Act(tag.to_string())
                    }
                }
                _ => Command::Say(line.to_string()),
            },
        }
    }
}

pub const HELP: &str = "Commands: stats | reload | emotion | reset | /act <tag> | quit. Any other line is spoken.";
