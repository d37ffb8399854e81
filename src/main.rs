use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};

use skiff::diagnostic::{Diagnostic, ansi, json};
use skiff::{Engine, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Emit {
    /// Assembly listing of the compiled unit
    Asm,
    /// Parsed AST as JSON
    Ast,
}

#[derive(Parser)]
#[command(name = "skiff", version, about = "skiff — a small embeddable scripting language")]
struct Cli {
    /// Script file to run
    #[arg(required_unless_present = "eval")]
    file: Option<PathBuf>,

    /// Inline source to run instead of a file
    #[arg(short = 'e', long = "eval", value_name = "CODE")]
    eval: Option<String>,

    /// Print the compiled form instead of executing
    #[arg(long, value_enum)]
    emit: Option<Emit>,

    /// Render errors as JSON (one object per line)
    #[arg(long, conflicts_with = "text")]
    json: bool,

    /// Render errors as plain text
    #[arg(long)]
    text: bool,

    /// Force ANSI colors even when NO_COLOR is set
    #[arg(long, conflicts_with_all = ["json", "text"])]
    ansi: bool,

    /// Arguments handed to the script as the `args` global
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

fn main() -> ExitCode {
    let mut cli = Cli::parse();

    // with -e, a bare positional is a script argument, not a file
    if cli.eval.is_some() {
        if let Some(stray) = cli.file.take() {
            cli.args.insert(0, stray.display().to_string());
        }
    }

    let (source, unit) = match &cli.eval {
        Some(code) => (code.clone(), "eval".to_string()),
        None => {
            let path = cli.file.clone().unwrap_or_default();
            let unit = path.display().to_string();
            match std::fs::read_to_string(&path) {
                Ok(source) => (source, unit),
                Err(e) => {
                    eprintln!("error reading {}: {}", unit, e);
                    return ExitCode::FAILURE;
                }
            }
        }
    };

    match cli.emit {
        Some(Emit::Ast) => return emit_ast(&cli, &source, &unit),
        Some(Emit::Asm) => return emit_asm(&cli, &source, &unit),
        None => {}
    }

    let mut engine = Engine::new();
    let script_args: Vec<Value> = cli.args.iter().map(|a| engine.new_string(a)).collect();
    let args_value = engine.new_array(script_args);
    engine.set_global("args", args_value);

    match engine.run(&source, &unit) {
        Ok(Value::Null) => ExitCode::SUCCESS,
        Ok(value) => {
            println!("{}", engine.render(value));
            ExitCode::SUCCESS
        }
        Err(e) => {
            report(&cli, Diagnostic::from(&e));
            ExitCode::FAILURE
        }
    }
}

fn emit_ast(cli: &Cli, source: &str, unit: &str) -> ExitCode {
    let tokens = skiff::lexer::lex(source);
    match skiff::parser::parse(tokens, unit) {
        Ok(block) => match serde_json::to_string_pretty(&block) {
            Ok(text) => {
                println!("{}", text);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("serialization error: {}", e);
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            report(cli, Diagnostic::from(&e));
            ExitCode::FAILURE
        }
    }
}

fn emit_asm(cli: &Cli, source: &str, unit: &str) -> ExitCode {
    let mut engine = Engine::new();
    match engine.compile(source, unit) {
        Ok(code) => {
            print!("{}", skiff::bytecode::listing(&code));
            ExitCode::SUCCESS
        }
        Err(e) => {
            report(cli, Diagnostic::from(&e));
            ExitCode::FAILURE
        }
    }
}

fn report(cli: &Cli, d: Diagnostic) {
    if cli.json {
        eprintln!("{}", json::render(&d));
    } else if cli.text {
        eprint!("{}", ansi::render(&d, false));
    } else {
        let color = cli.ansi || std::env::var_os("NO_COLOR").is_none();
        eprint!("{}", ansi::render(&d, color));
    }
}
