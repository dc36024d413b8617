use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::{self, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
  Step(u32), // Step N times
  Stats,
  Probe(u64),
  Quit,
  Continue,
}

const HELP: &str = "Enter to step, 'si N' to step N times, 'stats', 'tlb <vaddr>', 'c' to continue, 'q' to quit";

fn parse_addr(s: &str) -> Option<u64> {
  match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
    Some(hex) => u64::from_str_radix(hex, 16).ok(),
    None => s.parse().ok(),
  }
}

/// Parses one line of step-mode input; `Err` carries the message to show.
pub fn parse_command(line: &str) -> std::result::Result<Command, String> {
  let trimmed = line.trim();
  match trimmed {
    "" => return Ok(Command::Step(1)),
    "q" => return Ok(Command::Quit),
    "c" => return Ok(Command::Continue),
    "stats" => return Ok(Command::Stats),
    _ => {},
  }

  if let Some(num_str) = trimmed.strip_prefix("si") {
    let num_str = num_str.trim();
    if num_str.is_empty() {
      return Err("'si' requires a number, e.g., 'si 100'".to_string());
    }
    return match num_str.parse::<u32>() {
      Ok(n) if n > 0 => Ok(Command::Step(n)),
      Ok(_) => Err("step count must be greater than 0".to_string()),
      Err(e) => Err(format!("invalid number '{}': {}", num_str, e)),
    };
  }

  if let Some(addr) = trimmed.strip_prefix("tlb") {
    return parse_addr(addr.trim())
      .map(Command::Probe)
      .ok_or_else(|| format!("invalid address '{}'", addr.trim()));
  }

  Err(format!("Unknown command: '{}'. {}", trimmed, HELP))
}

pub struct Shell {
  editor: DefaultEditor,
}

impl Shell {
  pub fn new() -> Result<Self> {
    let editor = DefaultEditor::new().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    Ok(Self { editor })
  }

  pub fn help() -> &'static str {
    HELP
  }

  pub fn read_command(&mut self) -> Result<Command> {
    loop {
      match self.editor.readline("(dmaxlat) ") {
        Ok(line) => {
          let trimmed = line.trim();
          if !trimmed.is_empty() {
            let _ = self.editor.add_history_entry(trimmed);
          }
          match parse_command(trimmed) {
            Ok(cmd) => return Ok(cmd),
            Err(msg) => eprintln!("Error: {}", msg),
          }
        },
        // Ctrl-C / Ctrl-D
        Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => return Ok(Command::Quit),
        Err(err) => return Err(io::Error::new(io::ErrorKind::Other, err)),
      }
    }
  }
}
