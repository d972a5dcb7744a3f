//! Console transport
//!
//! An interactive REPL that behaves like a chat client: every line is a
//! message from the current console chat. `/chat <id>` switches chats so
//! transfers between chats can be driven by hand.

use std::borrow::Cow;
use std::sync::Arc;

use nu_ansi_term::{Color, Style};
use reedline::{
    ColumnarMenu, Completer, DefaultHinter, Emacs, KeyCode, KeyModifiers, Keybindings,
    MenuBuilder, Prompt, PromptEditMode, PromptHistorySearch, Reedline, ReedlineEvent,
    ReedlineMenu, Signal, Span, Suggestion,
};
use relay_core::{IncomingMessage, MessageHandler};
use tracing::info;

/// Chat type reported for console messages
pub const CONSOLE_CHAT_TYPE: &str = "private";

/// Sender id reported for console messages
pub const CONSOLE_SENDER: &str = "console";

/// Available commands for autocomplete display
const COMMANDS: &[(&str, &str)] = &[
    ("/help", "Show commands"),
    ("/status", "Show this chat's conversation state"),
    ("/reset", "Start a fresh conversation"),
    ("/transfer", "Move another chat's conversation here"),
    ("/resume", "Continue a conversation by id"),
    ("/chat", "Switch the console chat id"),
    ("/exit", "Quit"),
];

/// Completes `/` commands from [`COMMANDS`]
#[derive(Clone, Copy, Default)]
pub struct CommandCompleter;

impl Completer for CommandCompleter {
    fn complete(&mut self, line: &str, pos: usize) -> Vec<Suggestion> {
        if !line.starts_with('/') {
            return Vec::new();
        }

        COMMANDS
            .iter()
            .filter(|(cmd, _)| cmd.starts_with(line))
            .map(|(cmd, desc)| Suggestion {
                value: cmd.to_string(),
                description: Some(desc.to_string()),
                extra: None,
                span: Span::new(0, pos),
                append_whitespace: true,
                style: None,
            })
            .collect()
    }
}

/// Prompt showing the active console chat
struct ChatPrompt {
    chat_id: String,
    style: Style,
}

impl ChatPrompt {
    fn new(chat_id: &str) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            style: Color::Cyan.bold(),
        }
    }
}

impl Prompt for ChatPrompt {
    fn render_prompt_left(&self) -> Cow<'_, str> {
        Cow::Owned(self.style.paint(format!("[{}]> ", self.chat_id)).to_string())
    }

    fn render_prompt_right(&self) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_indicator(&self, _prompt_mode: PromptEditMode) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_multiline_indicator(&self) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_history_search_indicator(
        &self,
        _history_search: PromptHistorySearch,
    ) -> Cow<'_, str> {
        Cow::Borrowed("")
    }
}

/// What the console does with one input line
#[derive(Debug, PartialEq, Eq)]
enum ConsoleAction<'a> {
    Exit,
    SwitchChat(Option<&'a str>),
    Forward(&'a str),
}

fn console_action(input: &str) -> ConsoleAction<'_> {
    let mut parts = input.split_whitespace();
    match parts.next() {
        Some("/exit") | Some("/quit") | Some("/q") => ConsoleAction::Exit,
        Some("/chat") => ConsoleAction::SwitchChat(parts.next()),
        _ => ConsoleAction::Forward(input),
    }
}

/// Send one message as `chat_id` and print the reply.
pub async fn send(handler: &MessageHandler, chat_id: &str, text: &str) {
    let msg = IncomingMessage::new(chat_id, CONSOLE_CHAT_TYPE, CONSOLE_SENDER, text);
    match handler.handle(&msg).await {
        Some(reply) => println!("\n{}\n", reply),
        None => eprintln!("\nChat {} is not in the allow list.\n", chat_id),
    }
}

/// Run the interactive console until `/exit` or Ctrl+D.
pub async fn run_repl(handler: Arc<MessageHandler>, chat_id: String) -> anyhow::Result<()> {
    let mut chat_id = chat_id;
    info!(chat_id = %chat_id, "Starting console transport");
    print_welcome(&chat_id);

    let mut keybindings = default_keybindings();
    keybindings.add_binding(
        KeyModifiers::NONE,
        KeyCode::Char('/'),
        ReedlineEvent::Edit(vec![reedline::EditCommand::Complete]),
    );

    let menu = Box::new(
        ColumnarMenu::default()
            .with_name("command_menu")
            .with_columns(1)
            .with_column_width(Some(40))
            .with_only_buffer_difference(false),
    );
    let hinter = DefaultHinter::default().with_style(Style::new().dimmed());

    let mut line_editor = Reedline::create()
        .with_completer(Box::new(CommandCompleter))
        .with_menu(ReedlineMenu::EngineCompleter(menu))
        .with_hinter(Box::new(hinter))
        .with_edit_mode(Box::new(Emacs::new(keybindings)));

    let mut prompt = ChatPrompt::new(&chat_id);

    loop {
        match line_editor.read_line(&prompt) {
            Ok(Signal::Success(line)) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }

                match console_action(input) {
                    ConsoleAction::Exit => break,
                    ConsoleAction::SwitchChat(Some(next)) => {
                        chat_id = next.to_string();
                        prompt = ChatPrompt::new(&chat_id);
                        println!("\nNow chatting as {}\n", chat_id);
                    }
                    ConsoleAction::SwitchChat(None) => {
                        println!("\nCurrent chat: {}. Usage: /chat <id>\n", chat_id);
                    }
                    ConsoleAction::Forward(text) => send(&handler, &chat_id, text).await,
                }
            }
            Ok(Signal::CtrlC) => {
                println!("^C");
                continue;
            }
            Ok(Signal::CtrlD) => break,
            Err(err) => {
                eprintln!("\nConsole error: {}\n", err);
                break;
            }
        }
    }

    println!("\nBye.\n");
    Ok(())
}

/// Default keybindings for reedline
fn default_keybindings() -> Keybindings {
    let mut keybindings = Keybindings::new();

    keybindings.add_binding(
        KeyModifiers::NONE,
        KeyCode::Tab,
        ReedlineEvent::Edit(vec![reedline::EditCommand::Complete]),
    );
    keybindings.add_binding(KeyModifiers::NONE, KeyCode::Enter, ReedlineEvent::Submit);
    keybindings.add_binding(KeyModifiers::NONE, KeyCode::Esc, ReedlineEvent::Esc);
    keybindings.add_binding(KeyModifiers::CONTROL, KeyCode::Char('c'), ReedlineEvent::CtrlC);
    keybindings.add_binding(KeyModifiers::CONTROL, KeyCode::Char('d'), ReedlineEvent::CtrlD);
    keybindings.add_binding(KeyModifiers::NONE, KeyCode::Up, ReedlineEvent::Up);
    keybindings.add_binding(KeyModifiers::NONE, KeyCode::Down, ReedlineEvent::Down);

    keybindings
}

fn print_welcome(chat_id: &str) {
    let title = Color::Cyan.bold();
    println!();
    println!("{}", title.paint("cc-relay console"));
    println!("Chatting as {}. Type /help for commands, /exit to quit.", chat_id);
    println!();
}
