//! Serial request loop for the embedder child process.
//!
//! One JSON frame per line on stdin/stdout. Requests execute strictly in
//! arrival order, one at a time; an error answers the request and the
//! loop keeps going. E5-style prefixes are applied here based on
//! `is_query`; the host never prefixes.

use std::{
  io::{BufRead, Write},
  path::Path,
};

use ipc::{ChildRequest, ChildResponse};
use tracing::{debug, info, warn};

use crate::model::EmbeddingModel;

const QUERY_PREFIX: &str = "query: ";
const PASSAGE_PREFIX: &str = "passage: ";

/// Minimal surface the serve loop needs from a model, so the loop can be
/// exercised without ONNX weights.
pub trait Embedder {
  fn embed(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>, String>;
}

impl Embedder for EmbeddingModel {
  fn embed(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
    EmbeddingModel::embed(self, texts).map_err(|e| e.to_string())
  }
}

/// Resident set of this process, reported back with every response.
fn current_rss_bytes() -> u64 {
  #[cfg(target_os = "linux")]
  {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
      return 0;
    };
    let resident_pages: u64 = statm
      .split_whitespace()
      .nth(1)
      .and_then(|v| v.parse().ok())
      .unwrap_or(0);
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
    resident_pages * page_size
  }
  #[cfg(not(target_os = "linux"))]
  {
    0
  }
}

/// Run the serve loop on real stdin/stdout, loading the ONNX model on
/// `init`. This is the entry point of the `embed-worker` subcommand.
pub fn serve() -> std::io::Result<()> {
  let stdin = std::io::stdin();
  let stdout = std::io::stdout();
  serve_with(
    |model_dir, dim| {
      EmbeddingModel::load(model_dir, dim)
        .map(|m| Box::new(m) as Box<dyn Embedder>)
        .map_err(|e| e.to_string())
    },
    stdin.lock(),
    stdout.lock(),
  )
}

/// Serve loop over arbitrary streams with an injectable model loader.
pub fn serve_with<L>(mut load: L, reader: impl BufRead, mut writer: impl Write) -> std::io::Result<()>
where
  L: FnMut(&Path, usize) -> Result<Box<dyn Embedder>, String>,
{
  info!("Embedder child serving");
  let mut model: Option<Box<dyn Embedder>> = None;

  for line in reader.lines() {
    let line = line?;
    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }

    let request: ChildRequest = match serde_json::from_str(trimmed) {
      Ok(request) => request,
      Err(e) => {
        warn!(error = %e, "Unparseable request frame, skipping");
        continue;
      }
    };

    let response = match request {
      ChildRequest::Init { id, model_dir, dim } => match load(&model_dir, dim) {
        Ok(loaded) => {
          model = Some(loaded);
          debug!(id, "Model initialised");
          ChildResponse::ready(id, current_rss_bytes())
        }
        Err(e) => ChildResponse::error(id, e),
      },
      ChildRequest::Embed { id, texts, is_query } => match model.as_mut() {
        Some(model) => {
          let prefixed = apply_prefix(&texts, is_query);
          match model.embed(&prefixed) {
            Ok(vectors) => ChildResponse::vectors(id, vectors, current_rss_bytes()),
            Err(e) => ChildResponse::error(id, e),
          }
        }
        None => ChildResponse::error(id, "embed before init"),
      },
      ChildRequest::Shutdown => {
        info!("Embedder child shutting down");
        break;
      }
    };

    let json = serde_json::to_string(&response).map_err(std::io::Error::other)?;
    writeln!(writer, "{json}")?;
    writer.flush()?;
  }

  Ok(())
}

fn apply_prefix(texts: &[String], is_query: bool) -> Vec<String> {
  let prefix = if is_query { QUERY_PREFIX } else { PASSAGE_PREFIX };
  texts.iter().map(|t| format!("{prefix}{t}")).collect()
}

#[cfg(test)]
mod tests {
  use std::io::Cursor;

  use super::*;

  /// Fake model recording what it was asked to embed.
  struct FakeModel {
    seen: std::rc::Rc<std::cell::RefCell<Vec<Vec<String>>>>,
    fail_next: bool,
  }

  impl Embedder for FakeModel {
    fn embed(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
      if self.fail_next {
        self.fail_next = false;
        return Err("scripted failure".to_string());
      }
      self.seen.borrow_mut().push(texts.to_vec());
      Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
    }
  }

  fn run_script(requests: &[&str]) -> (Vec<ChildResponse>, std::rc::Rc<std::cell::RefCell<Vec<Vec<String>>>>) {
    run_script_with(requests, false)
  }

  fn run_script_with(
    requests: &[&str],
    fail_first_embed: bool,
  ) -> (Vec<ChildResponse>, std::rc::Rc<std::cell::RefCell<Vec<Vec<String>>>>) {
    let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let seen_for_loader = seen.clone();

    let input = requests.join("\n");
    let mut output = Vec::new();

    serve_with(
      move |_dir, _dim| {
        Ok(Box::new(FakeModel {
          seen: seen_for_loader.clone(),
          fail_next: fail_first_embed,
        }) as Box<dyn Embedder>)
      },
      Cursor::new(input),
      &mut output,
    )
    .unwrap();

    let responses = String::from_utf8(output)
      .unwrap()
      .lines()
      .map(|l| serde_json::from_str(l).unwrap())
      .collect();
    (responses, seen)
  }

  #[test]
  fn test_init_then_embed_in_order() {
    let (responses, seen) = run_script(&[
      r#"{"op":"init","id":0,"model_dir":"/models/e5","dim":4}"#,
      r#"{"op":"embed","id":1,"texts":["first"],"is_query":false}"#,
      r#"{"op":"embed","id":2,"texts":["second"],"is_query":false}"#,
      r#"{"op":"shutdown"}"#,
    ]);

    assert_eq!(responses.len(), 3);
    assert_eq!(responses[0].id, 0);
    assert_eq!(responses[0].ready, Some(true));
    // Strict arrival order: request 1 completes before request 2 begins.
    assert_eq!(responses[1].id, 1);
    assert_eq!(responses[2].id, 2);
    assert!(responses[1].vectors.is_some());

    let seen = seen.borrow();
    assert_eq!(seen[0], vec!["passage: first".to_string()]);
    assert_eq!(seen[1], vec!["passage: second".to_string()]);
  }

  #[test]
  fn test_query_and_passage_prefixes_differ() {
    let (_responses, seen) = run_script(&[
      r#"{"op":"init","id":0,"model_dir":"/m","dim":4}"#,
      r#"{"op":"embed","id":1,"texts":["find my tax file"],"is_query":true}"#,
      r#"{"op":"embed","id":2,"texts":["find my tax file"],"is_query":false}"#,
    ]);

    let seen = seen.borrow();
    assert_eq!(seen[0], vec!["query: find my tax file".to_string()]);
    assert_eq!(seen[1], vec!["passage: find my tax file".to_string()]);
  }

  #[test]
  fn test_error_does_not_stop_subsequent_requests() {
    let (responses, _) = run_script_with(
      &[
        r#"{"op":"init","id":0,"model_dir":"/m","dim":4}"#,
        r#"{"op":"embed","id":1,"texts":["boom"],"is_query":false}"#,
        r#"{"op":"embed","id":2,"texts":["fine"],"is_query":false}"#,
      ],
      true,
    );

    assert_eq!(responses[1].error.as_deref(), Some("scripted failure"));
    assert!(responses[2].vectors.is_some(), "loop must continue after an error");
  }

  #[test]
  fn test_embed_before_init_is_answered_not_fatal() {
    let (responses, _) = run_script(&[
      r#"{"op":"embed","id":5,"texts":["early"],"is_query":false}"#,
      r#"{"op":"init","id":6,"model_dir":"/m","dim":4}"#,
    ]);

    assert_eq!(responses[0].id, 5);
    assert!(responses[0].error.is_some());
    assert_eq!(responses[1].ready, Some(true));
  }

  #[test]
  fn test_failed_init_reports_error() {
    let input = r#"{"op":"init","id":0,"model_dir":"/nope","dim":4}"#;
    let mut output = Vec::new();
    serve_with(
      |_dir, _dim| Err("model files missing".to_string()),
      Cursor::new(input),
      &mut output,
    )
    .unwrap();

    let response: ChildResponse = serde_json::from_str(String::from_utf8(output).unwrap().trim()).unwrap();
    assert_eq!(response.error.as_deref(), Some("model files missing"));
  }
}
