use std::sync::Arc;

use crate::session::{Session, SessionManager};

pub const LIST_COMMAND: &str = "list";
pub const PROMPT: &str = "Please. Enter number or command";
pub const WELCOME: &str = "Welcome user.\r\n Commands:\r\n List - Show all connected users";
pub const LIMIT_REACHED: &str = "Limit value reached";

/// Turns one line of user input into the reply text.
pub struct CommandHandler {
    sessions: Arc<SessionManager>,
}

impl CommandHandler {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    pub fn handle(&self, session: &Session, line: &str) -> String {
        let command = line.trim();
        if command == LIST_COMMAND {
            return self.sessions.render_all().join("\r\n");
        }

        match command.parse::<i32>() {
            Ok(value) => {
                session.add(value);
                match session.sum() {
                    Some(sum) => sum.to_string(),
                    None => format!("{LIMIT_REACHED} {}", i32::MAX),
                }
            }
            Err(_) => PROMPT.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use socket_engine::{
        server::ConnectionRegistry,
        transport::{ScriptedTransport, SharedTransport},
    };

    use super::*;

    fn handler_with_session(registry: &ConnectionRegistry) -> (CommandHandler, Arc<Session>) {
        let sessions = Arc::new(SessionManager::new());
        let transport: SharedTransport = Arc::new(ScriptedTransport::connected(SocketAddr::from((
            [127, 0, 0, 1],
            5555,
        ))));
        let (record, _) = registry.register(&transport);
        let (session, _) = sessions.is_new_connection(record.id, "127.0.0.1");
        (CommandHandler::new(sessions), session)
    }

    #[test]
    fn numbers_accumulate() {
        let registry = ConnectionRegistry::new();
        let (handler, session) = handler_with_session(&registry);

        assert_eq!(handler.handle(&session, "5"), "5");
        assert_eq!(handler.handle(&session, "10\r\n"), "15");
        assert_eq!(handler.handle(&session, " -20 "), "-5");
    }

    #[test]
    fn overflow_reports_the_limit() {
        let registry = ConnectionRegistry::new();
        let (handler, session) = handler_with_session(&registry);

        handler.handle(&session, "2147483647");
        assert_eq!(handler.handle(&session, "1"), "Limit value reached 2147483647");
    }

    #[test]
    fn anything_else_gets_the_prompt() {
        let registry = ConnectionRegistry::new();
        let (handler, session) = handler_with_session(&registry);

        for line in ["hello", "", "1.5", "99999999999", "LIST now"] {
            assert_eq!(handler.handle(&session, line), PROMPT, "input {line:?}");
        }
        assert_eq!(session.sum(), Some(0));
    }

    #[test]
    fn list_shows_every_session() {
        let registry = ConnectionRegistry::new();
        let (handler, session) = handler_with_session(&registry);
        handler.handle(&session, "7");

        assert_eq!(handler.handle(&session, "list\r\n"), "IP: 127.0.0.1 Sum: 7");
    }
}
