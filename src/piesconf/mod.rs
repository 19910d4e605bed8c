//! Structure-preserving model of the pies configuration file.
//!
//! Only two directives are recognised: the `control { socket URL; }` block
//! (read-only) and `component NAME_NUM { … }` blocks for runners this tool
//! manages. Everything else is carried through the token sequence untouched,
//! so a human-edited file survives a rewrite with its comments, whitespace
//! and unknown directives intact.

mod lexer;

pub use lexer::{Lexer, Locus, Token, TokenId, TokenKind};

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tempfile::NamedTempFile;
use tracing::warn;
use url::Url;

use crate::{Error, Result};

/// Component names of managed runners: `<project>_<num>`.
static RUNNER_NAME_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+?)_(\d+)").expect("runner name pattern"));

/// One managed runner, bounded by the inclusive token range of its
/// `component NAME { … }` statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Runner {
    /// Ordinal suffix parsed from the component name.
    pub num: u32,
    /// Index of the `component` keyword token.
    pub token_start: TokenId,
    /// Index of the closing `}` token.
    pub token_end: TokenId,
    /// Decoded `chdir` argument: the runner's working directory.
    pub dir: String,
}

#[derive(Debug)]
pub struct PiesConfig {
    pub filename: PathBuf,
    /// Set when a `control { socket URL; }` block parsed successfully.
    pub control_url: Option<Url>,
    /// Managed runners per project, sorted by `num` ascending.
    pub runners: BTreeMap<String, Vec<Runner>>,
    /// The canonical representation of the file. Every textual change goes
    /// through this sequence.
    pub tokens: Vec<Token>,
}

/// Parse a pies configuration file into the token-sequence model.
pub fn parse(filename: &Path) -> Result<PiesConfig> {
    let mut lexer = Lexer::from_file(filename)?;
    let mut control_url = None;
    let mut runners: BTreeMap<String, Vec<Runner>> = BTreeMap::new();

    loop {
        let id = lexer.next_significant()?;
        let t = lexer.token(id);
        if t.is_eof() {
            break;
        }
        if t.kind == TokenKind::Word {
            match t.text.as_str() {
                "control" => parse_control(&mut lexer, &mut control_url)?,
                "component" => parse_component(&mut lexer, id, &mut runners)?,
                _ => {
                    lexer.skip_statement()?;
                }
            }
        }
    }

    for list in runners.values_mut() {
        list.sort_by_key(|r| r.num);
    }

    Ok(PiesConfig {
        filename: filename.to_path_buf(),
        control_url,
        runners,
        tokens: lexer.into_tokens(),
    })
}

fn parse_control(lexer: &mut Lexer, control_url: &mut Option<Url>) -> Result<()> {
    let id = lexer.next_significant()?;
    if lexer.token(id).is_eof() {
        return Ok(());
    }
    if !lexer.token(id).is_punct("{") {
        lexer.skip_statement()?;
        return Ok(());
    }

    let id = lexer.next_significant()?;
    if lexer.token(id).is_word("socket") {
        let id = lexer.next_significant()?;
        let t = lexer.token(id);
        if t.is_text() {
            match Url::parse(&t.text) {
                Ok(url) => *control_url = Some(url),
                Err(err) => warn!("{}: can't parse URL: {}", t.locus, err),
            }
        }
    }
    lexer.skip_block()?;
    Ok(())
}

fn parse_component(
    lexer: &mut Lexer,
    start: TokenId,
    runners: &mut BTreeMap<String, Vec<Runner>>,
) -> Result<()> {
    let id = lexer.next_significant()?;
    if lexer.token(id).is_eof() {
        return Ok(());
    }

    let mut matched = None;
    let t = lexer.token(id);
    if t.is_text()
        && let Some(caps) = RUNNER_NAME_RX.captures(&t.text)
        && let Ok(num) = caps[2].parse::<u32>()
    {
        matched = Some((caps[1].to_string(), num));
    }

    let end = lexer.skip_statement()?;

    // Foreign components are skipped; a managed one is catalogued only when
    // its chdir directive names the runner directory.
    let Some((project, num)) = matched else {
        return Ok(());
    };
    let tokens = lexer.tokens();
    let mut i = start;
    while i < end {
        if tokens[i].is_word("chdir") {
            i += 1;
            while i < end && tokens[i].is_ws() {
                i += 1;
            }
            if i < end && tokens[i].is_text() {
                runners.entry(project).or_default().push(Runner {
                    num,
                    token_start: start,
                    token_end: end,
                    dir: tokens[i].text.clone(),
                });
            }
            break;
        }
        i += 1;
    }
    Ok(())
}

/// Re-quote a decoded string, escaping what the lexer decodes.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\x07' => out.push_str("\\a"),
            '\x08' => out.push_str("\\b"),
            '\x0c' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x0b' => out.push_str("\\v"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

impl PiesConfig {
    /// Emit the token sequence. Strings are re-quoted; everything else is
    /// written verbatim.
    pub fn write<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        for t in &self.tokens {
            match t.kind {
                TokenKind::String => w.write_all(quote(&t.text).as_bytes())?,
                _ => w.write_all(t.text.as_bytes())?,
            }
        }
        Ok(())
    }

    /// Atomically replace the file: write a sibling temporary file, fsync it,
    /// remove the original (ignoring not-found) and rename the temporary into
    /// place. After this returns either the old or the new contents are fully
    /// visible, never a partial state.
    pub fn save(&self) -> Result<()> {
        let dir = self.filename.parent().unwrap_or(Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| {
            Error::Other(format!("can't create temporary file in {}: {}", dir.display(), e))
        })?;
        self.write(&mut tmp)?;
        tmp.as_file().sync_all()?;

        match fs::remove_file(&self.filename) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                return Err(Error::Other(format!(
                    "can't remove {}: {}",
                    self.filename.display(),
                    e
                )));
            }
            _ => {}
        }

        tmp.persist(&self.filename).map_err(|e| {
            Error::Other(format!("can't rename into {}: {}", self.filename.display(), e))
        })?;
        Ok(())
    }

    /// Number the next runner for a project: one past the highest existing
    /// number, or 0 for a new project.
    pub fn next_num(&self, project: &str) -> u32 {
        self.runners
            .get(project)
            .and_then(|list| list.last())
            .map_or(0, |r| r.num + 1)
    }

    /// Append an expanded component block. The text is carried as a single
    /// WORD token and not re-lexed; it only joins the structured model on the
    /// next parse from disk, so every mutation is save-then-reparse before
    /// any further mutation.
    pub fn add_runner(&mut self, text: String) {
        self.tokens.push(Token {
            kind: TokenKind::Word,
            text,
            locus: Locus::default(),
        });
    }

    /// Splice a runner's `component` statement out of the token sequence.
    /// The runner catalogue is stale afterwards; save and reparse before
    /// touching another runner.
    pub fn delete_runner(&mut self, runner: &Runner) {
        self.tokens.drain(runner.token_start..=runner.token_end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_config(text: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pies.conf");
        fs::write(&path, text).unwrap();
        (dir, path)
    }

    const SAMPLE: &str = r#"# managed by ghb
pidfile /run/pies.pid;

control {
	socket "inet://127.0.0.1:8073";
}

component web_0 {
	mode respawn;
	chdir "/srv/runners/web_0";
	command "./run.sh";
}

component web_1 {
	mode respawn;
	chdir "/srv/runners/web_1";
	command "./run.sh";
}

component postgres {
	mode respawn;
	command "/usr/bin/postgres";
}
"#;

    #[test]
    fn catalogues_runners_by_project() {
        let (_dir, path) = write_config(SAMPLE);
        let pc = parse(&path).unwrap();

        assert_eq!(pc.runners.len(), 1);
        let web = &pc.runners["web"];
        assert_eq!(web.len(), 2);
        assert_eq!(web[0].num, 0);
        assert_eq!(web[0].dir, "/srv/runners/web_0");
        assert_eq!(web[1].num, 1);
        assert_eq!(pc.next_num("web"), 2);
        assert_eq!(pc.next_num("db"), 0);
    }

    #[test]
    fn runner_token_range_bounds_the_statement() {
        let (_dir, path) = write_config(SAMPLE);
        let pc = parse(&path).unwrap();

        for r in &pc.runners["web"] {
            assert!(pc.tokens[r.token_start].is_word("component"));
            assert!(pc.tokens[r.token_end].is_punct("}"));
            let name = pc.tokens[r.token_start + 1..]
                .iter()
                .find(|t| !t.is_ws())
                .unwrap();
            assert_eq!(name.text, format!("web_{}", r.num));
        }
    }

    #[test]
    fn control_url_is_parsed() {
        let (_dir, path) = write_config(SAMPLE);
        let pc = parse(&path).unwrap();
        let url = pc.control_url.unwrap();
        assert_eq!(url.scheme(), "inet");
        assert_eq!(url.port(), Some(8073));
    }

    #[test]
    fn malformed_control_url_is_not_fatal() {
        let (_dir, path) = write_config("control { socket \"::::\"; }\n");
        let pc = parse(&path).unwrap();
        assert!(pc.control_url.is_none());
    }

    #[test]
    fn foreign_components_are_skipped() {
        let (_dir, path) = write_config(SAMPLE);
        let pc = parse(&path).unwrap();
        assert!(!pc.runners.contains_key("postgres"));
    }

    #[test]
    fn component_without_chdir_is_not_catalogued() {
        let (_dir, path) = write_config("component x_0 { mode respawn; }\n");
        let pc = parse(&path).unwrap();
        assert!(pc.runners.is_empty());
    }

    #[test]
    fn write_round_trips_byte_identically() {
        let (_dir, path) = write_config(SAMPLE);
        let pc = parse(&path).unwrap();
        let mut out = Vec::new();
        pc.write(&mut out).unwrap();
        assert_eq!(out, SAMPLE.as_bytes());
    }

    #[test]
    fn string_requoting_round_trips_escapes() {
        let (_dir, path) = write_config("component x_0 {\n\tchdir \"a\\\"b\\\\c\\nd\";\n}\n");
        let pc = parse(&path).unwrap();
        assert_eq!(pc.runners["x"][0].dir, "a\"b\\c\nd");

        let mut out = Vec::new();
        pc.write(&mut out).unwrap();
        fs::write(&path, &out).unwrap();
        let pc2 = parse(&path).unwrap();
        assert_eq!(pc2.runners["x"][0].dir, "a\"b\\c\nd");
    }

    #[test]
    fn delete_runner_splices_only_its_block() {
        let (_dir, path) = write_config(SAMPLE);
        let mut pc = parse(&path).unwrap();
        let doomed = pc.runners["web"][0].clone();
        pc.delete_runner(&doomed);
        pc.save().unwrap();

        let pc = parse(&path).unwrap();
        let web = &pc.runners["web"];
        assert_eq!(web.len(), 1);
        assert_eq!(web[0].num, 1);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("# managed by ghb"));
        assert!(text.contains("component postgres"));
        assert!(!text.contains("web_0"));
        assert!(text.contains("web_1"));
    }

    #[test]
    fn add_runner_appends_verbatim_block() {
        let (_dir, path) = write_config(SAMPLE);
        let mut pc = parse(&path).unwrap();
        pc.add_runner("component \"web_2\" {\n\tchdir \"/srv/runners/web_2\";\n}\n".to_string());
        pc.save().unwrap();

        let pc = parse(&path).unwrap();
        assert_eq!(pc.runners["web"].len(), 3);
        assert_eq!(pc.runners["web"][2].num, 2);
        assert_eq!(pc.runners["web"][2].dir, "/srv/runners/web_2");
    }

    #[test]
    fn save_replaces_atomically() {
        let (_dir, path) = write_config(SAMPLE);
        let pc = parse(&path).unwrap();
        pc.save().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), SAMPLE);
    }

    #[test]
    fn relexed_output_yields_same_tokens() {
        let (_dir, path) = write_config(SAMPLE);
        let pc = parse(&path).unwrap();
        let mut out = Vec::new();
        pc.write(&mut out).unwrap();

        let mut lexer = Lexer::from_bytes(out, "-");
        loop {
            let id = lexer.next_token().unwrap();
            if lexer.token(id).is_eof() {
                break;
            }
        }
        let relexed: Vec<_> = lexer
            .into_tokens()
            .into_iter()
            .map(|t| (t.kind, t.text))
            .collect();
        let original: Vec<_> = pc.tokens.into_iter().map(|t| (t.kind, t.text)).collect();
        assert_eq!(relexed, original);
    }

    #[test]
    fn unparsable_file_reports_locus() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pies.conf");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(b"component x_0 {\0}\n").unwrap();
        drop(f);
        assert!(matches!(parse(&path), Err(Error::Syntax(_, _))));
    }
}
