use std::ffi::OsString;
use std::fs;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};

use anyhow::{Context, Result, anyhow, bail};
use ariadne::Source;
use clap::Parser as ClapParser;
use clap::error::ErrorKind;
use hlx_codegen::{Codegen, RUNTIME_PREFIX};
use hlx_hir::{Resolver, Severity};
use hlx_lexer::Span;
use hlx_mir::{MirModule, lower_program};
use hlx_parser::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// C wrappers for the variadic functions generated code calls
const RUNTIME_SHIM: &str = include_str!("../runtime/hlx_rt.c");

/// Long options that are also accepted with a single dash
const SINGLE_DASH_FLAGS: &[&str] = &["help", "ast-dump", "res-dump", "llvm-dump"];

/// Ahead-of-time compiler for hlx programs
#[derive(ClapParser, Debug)]
#[command(name = "hlxc")]
struct CompilerOptions {
    /// Source file to compile
    source: Option<PathBuf>,

    /// Write the executable to <file>
    #[arg(short = 'o', value_name = "file")]
    output: Option<PathBuf>,

    /// Print the parsed tree and stop
    #[arg(long = "ast-dump")]
    ast_dump: bool,

    /// Print the resolved tree and stop
    #[arg(long = "res-dump")]
    res_dump: bool,

    /// Print the intermediate module and stop
    #[arg(long = "llvm-dump")]
    llvm_dump: bool,
}

/// Rewrite `-ast-dump` style options to `--ast-dump`
fn normalize_args(args: impl IntoIterator<Item = OsString>) -> Vec<OsString> {
    args.into_iter()
        .map(|arg| match arg.to_str() {
            Some(text)
                if !text.starts_with("--")
                    && text
                        .strip_prefix('-')
                        .is_some_and(|name| SINGLE_DASH_FLAGS.contains(&name)) =>
            {
                OsString::from(format!("-{}", text))
            }
            _ => arg,
        })
        .collect()
}

fn has_source_extension(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("hlx")
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("HLX_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> ExitCode {
    init_logging();

    let options = match CompilerOptions::try_parse_from(normalize_args(std::env::args_os())) {
        Ok(options) => options,
        Err(e) => {
            let _ = e.print();
            return if e.kind() == ErrorKind::DisplayHelp {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            };
        }
    };

    match run(&options) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(options: &CompilerOptions) -> Result<ExitCode> {
    let path = options
        .source
        .as_deref()
        .ok_or_else(|| anyhow!("no source file"))?;
    if !has_source_extension(path) {
        bail!("unexpected source file extension");
    }

    let source = fs::read_to_string(path).map_err(|e| {
        debug!(error = %e, "read failed");
        anyhow!("failed to open '{}'", path.display())
    })?;
    let file_name = path.display().to_string();
    let reporter = Reporter::new(&file_name, &source);

    let output = Parser::parse(&source);
    for error in &output.errors {
        reporter.report(Severity::Error, error.span, &error.message);
    }

    if options.ast_dump {
        print!("{}", output.file.pretty_print());
        return Ok(ExitCode::SUCCESS);
    }
    if !output.is_success() {
        return Ok(ExitCode::FAILURE);
    }

    let resolution = Resolver::resolve(&output.file);
    for diagnostic in &resolution.diagnostics {
        reporter.report(diagnostic.severity, diagnostic.span, &diagnostic.message);
    }

    if options.res_dump {
        if let Some(program) = &resolution.program {
            print!("{}", program.pretty_print());
        }
        return Ok(ExitCode::SUCCESS);
    }
    let Some(program) = resolution.program else {
        return Ok(ExitCode::FAILURE);
    };

    let module = lower_program(&program, &file_name);
    if options.llvm_dump {
        print!("{}", module.pretty_print());
        return Ok(ExitCode::SUCCESS);
    }

    build(&module, path, options.output.as_deref())
}

/// Renders diagnostics as `path:line:col: severity: message` on stderr
struct Reporter<'a> {
    path: &'a str,
    text: &'a str,
    source: Source<&'a str>,
}

impl<'a> Reporter<'a> {
    fn new(path: &'a str, text: &'a str) -> Self {
        Self {
            path,
            text,
            source: Source::from(text),
        }
    }

    /// 1-based line and column of a byte offset
    fn location(&self, offset: usize) -> (usize, usize) {
        let chars = self
            .text
            .get(..offset)
            .map_or(0, |prefix| prefix.chars().count());
        self.source
            .get_offset_line(chars)
            .map_or((1, 1), |(_, line, col)| (line + 1, col + 1))
    }

    fn format(&self, severity: Severity, span: Span, message: &str) -> String {
        let (line, col) = self.location(span.start);
        format!("{}:{}:{}: {}: {}", self.path, line, col, severity, message)
    }

    fn report(&self, severity: Severity, span: Span, message: &str) {
        eprintln!("{}", self.format(severity, span, message));
    }
}

/// Name shared by the temporary object and shim of one source file
fn artifact_stem(path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    format!("tmp-{}", hasher.finish())
}

/// Compile to an object file and hand it to the C compiler for linking
fn build(module: &MirModule, path: &Path, output: Option<&Path>) -> Result<ExitCode> {
    let mut codegen = Codegen::new(&module.name)?;
    codegen.compile(module)?;
    let object = codegen.finish()?;

    let stem = artifact_stem(path);
    let obj_path = PathBuf::from(format!("{}.o", stem));
    let shim_path = PathBuf::from(format!("{}.c", stem));

    let result = link(&object, &obj_path, &shim_path, output);

    let _ = fs::remove_file(&obj_path);
    let _ = fs::remove_file(&shim_path);
    result
}

fn link(object: &[u8], obj_path: &Path, shim_path: &Path, output: Option<&Path>) -> Result<ExitCode> {
    fs::write(obj_path, object)
        .with_context(|| format!("failed to write '{}'", obj_path.display()))?;
    fs::write(shim_path, RUNTIME_SHIM)
        .with_context(|| format!("failed to write '{}'", shim_path.display()))?;

    let linker = std::env::var("HLX_CC").unwrap_or_else(|_| "cc".to_string());
    let mut command = Command::new(&linker);
    command.arg(obj_path).arg(shim_path).arg("-lm");
    if let Some(output) = output {
        command.arg("-o").arg(output);
    }

    info!(?command, "invoking backend compiler");
    let status = command
        .status()
        .with_context(|| format!("failed to run '{}'", linker))?;

    // Killed by a signal
    let code = status.code().unwrap_or(1);
    debug!(code, "backend compiler finished");
    Ok(ExitCode::from(code as u8))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<OsString> {
        items.iter().map(OsString::from).collect()
    }

    fn parse(items: &[&str]) -> Result<CompilerOptions, clap::Error> {
        CompilerOptions::try_parse_from(normalize_args(args(items)))
    }

    #[test]
    fn test_normalize_single_dash_flags() {
        let normalized = normalize_args(args(&["hlxc", "-ast-dump", "a.hlx", "-o", "out"]));
        assert_eq!(normalized, args(&["hlxc", "--ast-dump", "a.hlx", "-o", "out"]));

        let normalized = normalize_args(args(&["hlxc", "--llvm-dump", "-res-dump", "-oout"]));
        assert_eq!(normalized, args(&["hlxc", "--llvm-dump", "--res-dump", "-oout"]));
    }

    #[test]
    fn test_parse_options() {
        let options = parse(&["hlxc", "main.hlx", "-res-dump", "-o", "prog"]).unwrap();
        assert_eq!(options.source, Some(PathBuf::from("main.hlx")));
        assert_eq!(options.output, Some(PathBuf::from("prog")));
        assert!(options.res_dump);
        assert!(!options.ast_dump);
        assert!(!options.llvm_dump);

        let options = parse(&["hlxc"]).unwrap();
        assert!(options.source.is_none());
    }

    #[test]
    fn test_help_and_unknown_options() {
        assert_eq!(parse(&["hlxc", "-h"]).unwrap_err().kind(), ErrorKind::DisplayHelp);
        assert_eq!(parse(&["hlxc", "-help"]).unwrap_err().kind(), ErrorKind::DisplayHelp);
        assert!(parse(&["hlxc", "-foo", "main.hlx"]).is_err());
        assert!(parse(&["hlxc", "a.hlx", "b.hlx"]).is_err());
    }

    #[test]
    fn test_source_extension() {
        assert!(has_source_extension(Path::new("main.hlx")));
        assert!(has_source_extension(Path::new("dir/prog.hlx")));
        assert!(!has_source_extension(Path::new("main.c")));
        assert!(!has_source_extension(Path::new("hlx")));
        assert!(!has_source_extension(Path::new("main.hlx.bak")));
    }

    #[test]
    fn test_usage_errors() {
        let options = parse(&["hlxc"]).unwrap();
        assert_eq!(run(&options).unwrap_err().to_string(), "no source file");

        let options = parse(&["hlxc", "main.txt"]).unwrap();
        assert_eq!(
            run(&options).unwrap_err().to_string(),
            "unexpected source file extension"
        );

        let options = parse(&["hlxc", "does/not/exist.hlx"]).unwrap();
        assert_eq!(
            run(&options).unwrap_err().to_string(),
            "failed to open 'does/not/exist.hlx'"
        );
    }

    #[test]
    fn test_diagnostic_location() {
        let text = "fn main(): void {\n  x = 1;\n}\n";
        let reporter = Reporter::new("test.hlx", text);
        assert_eq!(reporter.location(0), (1, 1));
        assert_eq!(reporter.location(20), (2, 3));
        assert_eq!(
            reporter.format(Severity::Error, Span::new(20, 21), "symbol 'x' not found"),
            "test.hlx:2:3: error: symbol 'x' not found"
        );
        assert_eq!(
            reporter.format(Severity::Warning, Span::new(3, 7), "unreachable statement"),
            "test.hlx:1:4: warning: unreachable statement"
        );
    }

    #[test]
    fn test_diagnostics_from_resolver() {
        let text = "fn main(): void {\n  return;\n  println(1);\n}\n";
        let output = Parser::parse(text);
        assert!(output.is_success());
        let resolution = Resolver::resolve(&output.file);

        let reporter = Reporter::new("w.hlx", text);
        let rendered: Vec<_> = resolution
            .diagnostics
            .iter()
            .map(|d| reporter.format(d.severity, d.span, &d.message))
            .collect();
        assert_eq!(rendered, vec!["w.hlx:3:3: warning: unreachable statement"]);
    }

    #[test]
    fn test_artifact_stem() {
        let a = artifact_stem(Path::new("main.hlx"));
        assert!(a.starts_with("tmp-"));
        assert_eq!(a, artifact_stem(Path::new("main.hlx")));
        assert_ne!(a, artifact_stem(Path::new("other.hlx")));
    }

    #[test]
    fn test_runtime_shim_matches_prefix() {
        assert!(RUNTIME_SHIM.contains(&format!("{}printf", RUNTIME_PREFIX)));
    }
}
