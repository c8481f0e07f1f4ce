/// Slash commands accepted from the UI surface. A leading `/<repo-name>`
/// segment scopes the command to that repo; otherwise it resolves against
/// the workspace's active repo.
#[derive(Debug, Clone, PartialEq)]
pub enum SlashCommand {
    NewSession { title: Option<String> },
    FollowUp { message: String },
    Summary,
    Run,
    Commit { message: Option<String> },
    Pr { title: Option<String> },
    Attach { pr_number: i64 },
    Diff,
    GitStatus,
    SetActiveRepo { repo_name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommand {
    pub repo_name: Option<String>,
    pub command: SlashCommand,
}

/// Parse one line of slash-command input. `known_repos` is consulted for
/// the optional repo prefix, so `/app diff` and `/diff` both work.
pub fn parse_slash_command(
    input: &str,
    known_repos: &[String],
) -> Result<ParsedCommand, String> {
    let trimmed = input.trim();
    let Some(body) = trimmed.strip_prefix('/') else {
        return Err(format!("Commands start with '/': {input}"));
    };
    if body.is_empty() {
        return Err("Empty command".to_string());
    }

    let (head, remainder) = split_word(body);
    if known_repos.iter().any(|name| name == head) {
        let (inner_head, inner_remainder) = split_word(remainder);
        if inner_head.is_empty() {
            return Err(format!("Missing command after repo '/{head}'"));
        }
        let command = parse_body(inner_head, inner_remainder)?;
        return Ok(ParsedCommand {
            repo_name: Some(head.to_string()),
            command,
        });
    }

    Ok(ParsedCommand {
        repo_name: None,
        command: parse_body(head, remainder)?,
    })
}

fn split_word(input: &str) -> (&str, &str) {
    let trimmed = input.trim_start();
    match trimmed.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (trimmed, ""),
    }
}

fn non_empty(remainder: &str) -> Option<String> {
    let trimmed = remainder.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_body(head: &str, remainder: &str) -> Result<SlashCommand, String> {
    match head {
        "new-session" => Ok(SlashCommand::NewSession {
            title: non_empty(remainder),
        }),
        "follow-up" => match non_empty(remainder) {
            Some(message) => Ok(SlashCommand::FollowUp { message }),
            None => Err("Usage: /follow-up <message>".to_string()),
        },
        "summary" => Ok(SlashCommand::Summary),
        "run" => Ok(SlashCommand::Run),
        "commit" => Ok(SlashCommand::Commit {
            message: non_empty(remainder),
        }),
        "pr" => Ok(SlashCommand::Pr {
            title: non_empty(remainder),
        }),
        "attach" => match non_empty(remainder) {
            Some(raw) => raw
                .parse::<i64>()
                .map(|pr_number| SlashCommand::Attach { pr_number })
                .map_err(|_| format!("Not a PR number: {raw}")),
            None => Err("Usage: /attach <pr-number>".to_string()),
        },
        "diff" => Ok(SlashCommand::Diff),
        "git-status" => Ok(SlashCommand::GitStatus),
        "set-active-repo" => match non_empty(remainder) {
            Some(repo_name) => Ok(SlashCommand::SetActiveRepo { repo_name }),
            None => Err("Usage: /set-active-repo <repo-name>".to_string()),
        },
        other => Err(format!("Unknown command: /{other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repos() -> Vec<String> {
        vec!["app".to_string(), "docs".to_string()]
    }

    #[test]
    fn bare_commands_parse() {
        assert_eq!(
            parse_slash_command("/summary", &repos()).unwrap().command,
            SlashCommand::Summary
        );
        assert_eq!(
            parse_slash_command("/diff", &repos()).unwrap(),
            ParsedCommand {
                repo_name: None,
                command: SlashCommand::Diff
            }
        );
        assert_eq!(
            parse_slash_command("/git-status", &repos()).unwrap().command,
            SlashCommand::GitStatus
        );
    }

    #[test]
    fn follow_up_keeps_the_raw_message() {
        let parsed = parse_slash_command("/follow-up also update the README", &repos()).unwrap();
        assert_eq!(
            parsed.command,
            SlashCommand::FollowUp {
                message: "also update the README".into()
            }
        );
        assert!(parse_slash_command("/follow-up", &repos()).is_err());
    }

    #[test]
    fn repo_prefix_scopes_the_command() {
        let parsed = parse_slash_command("/docs diff", &repos()).unwrap();
        assert_eq!(parsed.repo_name.as_deref(), Some("docs"));
        assert_eq!(parsed.command, SlashCommand::Diff);

        // A repo prefix alone is not a command.
        assert!(parse_slash_command("/docs", &repos()).is_err());
    }

    #[test]
    fn unknown_prefix_is_treated_as_a_command_name() {
        let error = parse_slash_command("/frontend diff", &repos()).unwrap_err();
        assert!(error.contains("/frontend"));
    }

    #[test]
    fn attach_requires_a_number() {
        assert_eq!(
            parse_slash_command("/attach 42", &repos()).unwrap().command,
            SlashCommand::Attach { pr_number: 42 }
        );
        assert!(parse_slash_command("/attach soon", &repos()).is_err());
        assert!(parse_slash_command("/attach", &repos()).is_err());
    }

    #[test]
    fn optional_arguments_default_to_none() {
        assert_eq!(
            parse_slash_command("/commit", &repos()).unwrap().command,
            SlashCommand::Commit { message: None }
        );
        assert_eq!(
            parse_slash_command("/commit fix the login flow", &repos())
                .unwrap()
                .command,
            SlashCommand::Commit {
                message: Some("fix the login flow".into())
            }
        );
        assert_eq!(
            parse_slash_command("/new-session", &repos()).unwrap().command,
            SlashCommand::NewSession { title: None }
        );
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(parse_slash_command("summary", &repos()).is_err());
        assert!(parse_slash_command("/", &repos()).is_err());
        assert!(parse_slash_command("", &repos()).is_err());
    }
}
