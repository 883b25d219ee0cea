//! Yes/no confirmation prompts.

use crate::{Error, Result};
use std::io::{self, BufRead, Write};
use std::sync::Mutex;

/// Asks the operator a yes/no question.
pub trait Confirm {
    /// Returns `true` if the operator answered yes.
    ///
    /// # Errors
    ///
    /// Returns an error if the question cannot be asked or answered.
    fn confirm(&self, question: &str) -> Result<bool>;
}

/// Interprets a single answer line.
///
/// Returns `None` for answers that are neither yes nor no.
#[must_use]
pub fn parse_answer(line: &str) -> Option<bool> {
    match line.trim().to_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" | "" => Some(false),
        _ => None,
    }
}

/// Line-based prompt defaulting to "no".
///
/// Writes `<question> [N/y]: ` and repeats it until the answer is `y`, `yes`,
/// `n`, `no` or empty. End of input counts as "no".
pub struct StdinConfirm<R, W> {
    io: Mutex<(R, W)>,
}

impl StdinConfirm<io::StdinLock<'static>, io::Stderr> {
    /// Prompts on stderr and reads answers from stdin.
    #[must_use]
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stderr())
    }
}

impl<R: BufRead, W: Write> StdinConfirm<R, W> {
    /// Creates a prompt over arbitrary input and output streams.
    pub const fn new(input: R, output: W) -> Self {
        Self {
            io: Mutex::new((input, output)),
        }
    }
}

impl<R: BufRead, W: Write> Confirm for StdinConfirm<R, W> {
    fn confirm(&self, question: &str) -> Result<bool> {
        let io_error = |operation: &str, e: io::Error| Error::OperationFailed {
            operation: operation.to_string(),
            cause: e.to_string(),
        };

        let mut guard = self
            .io
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let (input, output) = &mut *guard;

        loop {
            write!(output, "{question} [N/y]: ").map_err(|e| io_error("write_prompt", e))?;
            output.flush().map_err(|e| io_error("write_prompt", e))?;

            let mut line = String::new();
            let read = input
                .read_line(&mut line)
                .map_err(|e| io_error("read_answer", e))?;
            if read == 0 {
                return Ok(false);
            }

            if let Some(answer) = parse_answer(&line) {
                return Ok(answer);
            }
        }
    }
}

/// Answers every question the same way without asking.
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub bool);

impl Confirm for FixedAnswer {
    fn confirm(&self, _question: &str) -> Result<bool> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use test_case::test_case;

    fn ask(input: &str) -> (bool, String) {
        let prompt = StdinConfirm::new(Cursor::new(input.as_bytes().to_vec()), Vec::new());
        let answer = prompt.confirm("Delete reg.io/app:v1?").unwrap();
        let (_, output) = prompt.io.into_inner().unwrap();
        (answer, String::from_utf8(output).unwrap())
    }

    #[test_case("y", Some(true) ; "short yes")]
    #[test_case(" YES \n", Some(true) ; "loud yes")]
    #[test_case("n", Some(false) ; "short no")]
    #[test_case("No", Some(false) ; "mixed case no")]
    #[test_case("\n", Some(false) ; "empty")]
    #[test_case("maybe", None ; "unrecognized")]
    fn test_parse_answer(line: &str, expected: Option<bool>) {
        assert_eq!(parse_answer(line), expected);
    }

    #[test]
    fn test_yes_answer() {
        let (answer, output) = ask("yes\n");
        assert!(answer);
        assert_eq!(output, "Delete reg.io/app:v1? [N/y]: ");
    }

    #[test]
    fn test_empty_answer_is_no() {
        let (answer, _) = ask("\n");
        assert!(!answer);
    }

    #[test]
    fn test_unrecognized_answer_asks_again() {
        let (answer, output) = ask("sure\ny\n");
        assert!(answer);
        assert_eq!(output.matches("[N/y]").count(), 2);
    }

    #[test]
    fn test_end_of_input_is_no() {
        let (answer, _) = ask("");
        assert!(!answer);
    }

    #[test]
    fn test_fixed_answer() {
        assert!(FixedAnswer(true).confirm("anything").unwrap());
        assert!(!FixedAnswer(false).confirm("anything").unwrap());
    }
}
