/// Available commands and abbreviation matching

#[derive(Debug, Clone)]
pub struct Command {
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub usage: &'static str,
  pub description: &'static str,
}

/// All available commands
pub const COMMANDS: &[Command] = &[
  Command {
    name: "login",
    aliases: &["signin"],
    usage: "login <login> <password>",
    description: "Log in",
  },
  Command {
    name: "logout",
    aliases: &["signout"],
    usage: "logout",
    description: "Log out",
  },
  Command {
    name: "whoami",
    aliases: &["me"],
    usage: "whoami",
    description: "Show the logged-in user",
  },
  Command {
    name: "page",
    aliases: &["p"],
    usage: "page <n>",
    description: "Show one page of your tasks",
  },
  Command {
    name: "feed",
    aliases: &["f", "all"],
    usage: "feed",
    description: "Scroll through all tasks",
  },
  Command {
    name: "more",
    aliases: &["m", "next"],
    usage: "more",
    description: "Scroll to the end of the feed",
  },
  Command {
    name: "add",
    aliases: &["a", "new", "create"],
    usage: "add <text>",
    description: "Create a task",
  },
  Command {
    name: "toggle",
    aliases: &["t", "done"],
    usage: "toggle <id>",
    description: "Mark a task done or not done",
  },
  Command {
    name: "delete",
    aliases: &["d", "rm"],
    usage: "delete <id>",
    description: "Delete a task",
  },
  Command {
    name: "help",
    aliases: &["h", "?"],
    usage: "help",
    description: "List commands",
  },
  Command {
    name: "quit",
    aliases: &["q", "exit"],
    usage: "quit",
    description: "Exit taskq",
  },
];

/// Get suggestions for a given input, best first
pub fn get_suggestions(input: &str) -> Vec<&'static Command> {
  let input_lower = input.to_lowercase();

  if input_lower.is_empty() {
    return COMMANDS.iter().collect();
  }

  let mut matches: Vec<(&Command, u32)> = Vec::new();

  for cmd in COMMANDS {
    // Exact match on name
    if cmd.name == input_lower {
      matches.push((cmd, 0)); // Highest priority
      continue;
    }

    // Exact match on alias
    if cmd.aliases.contains(&input_lower.as_str()) {
      matches.push((cmd, 1));
      continue;
    }

    // Prefix match on name
    if cmd.name.starts_with(&input_lower) {
      matches.push((cmd, 2));
      continue;
    }

    // Prefix match on alias
    if cmd.aliases.iter().any(|a| a.starts_with(&input_lower)) {
      matches.push((cmd, 3));
    }
  }

  // Sort by priority
  matches.sort_by_key(|(_, priority)| *priority);

  matches.into_iter().map(|(cmd, _)| cmd).collect()
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResolveError {
  Unknown(String),
  /// Several commands share the prefix
  Ambiguous(Vec<&'static str>),
}

impl std::fmt::Display for ResolveError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ResolveError::Unknown(input) => write!(f, "unknown command: {} (try help)", input),
      ResolveError::Ambiguous(names) => {
        write!(f, "ambiguous command, did you mean {}?", names.join(", "))
      }
    }
  }
}

/// Resolve what the user typed to exactly one command.
///
/// Names and aliases win outright; otherwise the input must be a prefix of a
/// single command.
pub fn resolve(input: &str) -> Result<&'static Command, ResolveError> {
  let input_lower = input.to_lowercase();
  if let Some(cmd) = COMMANDS
    .iter()
    .find(|c| c.name == input_lower || c.aliases.contains(&input_lower.as_str()))
  {
    return Ok(cmd);
  }

  let suggestions = get_suggestions(&input_lower);
  match suggestions.as_slice() {
    [] => Err(ResolveError::Unknown(input.to_string())),
    [cmd] => Ok(*cmd),
    many => Err(ResolveError::Ambiguous(many.iter().map(|c| c.name).collect())),
  }
}

/// Split a line into its command word and the rest.
pub fn split(line: &str) -> Option<(&str, &str)> {
  let line = line.trim();
  if line.is_empty() {
    return None;
  }
  Some(match line.split_once(char::is_whitespace) {
    Some((word, rest)) => (word, rest.trim()),
    None => (line, ""),
  })
}
