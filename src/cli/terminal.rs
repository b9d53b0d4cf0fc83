use crossterm::{cursor, terminal};
use std::io::{self, Write};
use tokio::io::{AsyncBufRead, Lines};

use crate::core::{State, Verdict, VerificationObserver};

/// Prints lifecycle progress, redrawing the countdown on a single line.
#[derive(Default)]
pub struct TerminalObserver {
    counting: bool,
}

impl TerminalObserver {
    pub fn new() -> Self {
        Self::default()
    }

    fn end_countdown_line(&mut self) {
        if self.counting {
            crossterm::execute!(
                io::stdout(),
                cursor::MoveToColumn(0),
                terminal::Clear(terminal::ClearType::CurrentLine)
            ).ok();
            self.counting = false;
        }
    }
}

impl VerificationObserver for TerminalObserver {
    fn on_state(&mut self, state: State) {
        match state {
            State::Initializing => println!("📷 Opening camera..."),
            State::Live => println!("👀 Camera ready - look at the camera"),
            State::Captured => {
                self.end_countdown_line();
                println!("📸 Photo taken");
            }
            State::Submitting => println!("⏳ Submitting..."),
            _ => {}
        }
    }

    fn on_countdown(&mut self, remaining: u32) {
        self.counting = true;
        crossterm::execute!(
            io::stdout(),
            cursor::MoveToColumn(0),
            terminal::Clear(terminal::ClearType::CurrentLine)
        ).ok();
        print!("   Capturing in {}...", remaining);
        io::stdout().flush().ok();
    }

    fn on_resolved(&mut self, verdict: &Verdict) {
        self.end_countdown_line();
        if let Verdict::Fatal(report) = verdict {
            println!("❌ {}", report.user_message());
        }
    }

    fn on_cancelled(&mut self) {
        self.end_countdown_line();
        println!("🚫 Cancelled");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewChoice {
    Submit,
    Retake,
    Cancel,
}

pub fn parse_review(input: &str) -> Option<ReviewChoice> {
    match input.trim().to_ascii_lowercase().as_str() {
        "" | "y" | "yes" | "s" | "submit" => Some(ReviewChoice::Submit),
        "r" | "retake" => Some(ReviewChoice::Retake),
        "c" | "n" | "no" | "q" | "cancel" => Some(ReviewChoice::Cancel),
        _ => None,
    }
}

/// Asks until the answer is recognised. A closed or failing stdin cancels.
pub async fn prompt_review<R: AsyncBufRead + Unpin>(input: &mut Lines<R>) -> ReviewChoice {
    loop {
        print!("Submit this photo? [Y]es / [r]etake / [c]ancel: ");
        io::stdout().flush().ok();

        let line = tokio::select! {
            line = input.next_line() => line,
            _ = tokio::signal::ctrl_c() => return ReviewChoice::Cancel,
        };
        match line {
            Ok(Some(line)) => match parse_review(&line) {
                Some(choice) => return choice,
                None => println!("Please answer y, r or c."),
            },
            Ok(None) => return ReviewChoice::Cancel,
            Err(e) => {
                tracing::warn!("Failed to read answer: {}", e);
                return ReviewChoice::Cancel;
            }
        }
    }
}

/// Yes/no question defaulting to yes.
pub async fn confirm<R: AsyncBufRead + Unpin>(input: &mut Lines<R>, question: &str) -> bool {
    print!("{} [Y/n]: ", question);
    io::stdout().flush().ok();
    match input.next_line().await {
        Ok(Some(line)) => matches!(line.trim().to_ascii_lowercase().as_str(), "" | "y" | "yes"),
        _ => false,
    }
}
