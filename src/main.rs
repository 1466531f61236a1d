//! Interactive SQL shell.
//!
//! A readline REPL over a [`Database`] handle: statements accumulate
//! until a terminating semicolon, results print tab-separated, and a
//! few dot-commands expose the catalog.

use clap::Parser;
use quereus::{Config, Database, QuereusError, Value};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

#[derive(Parser, Debug)]
#[command(name = "quereus", about = "Quereus SQL shell", version)]
struct Args {
    /// Execute a single statement program and exit
    #[arg(short = 'c', long = "command")]
    command: Option<String>,

    /// Configuration file (defaults to quereus.toml discovery)
    #[arg(long = "config")]
    config: Option<String>,

    /// Print result rows as JSON arrays instead of tab-separated text
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

fn main() {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::from_file(path),
        None => Config::load(),
    }
    .unwrap_or_else(|err| {
        eprintln!("warning: bad configuration ({err}); using defaults");
        Config::default()
    });

    init_logging(&config);

    let db = Database::with_config(&config);
    if let Some(command) = &args.command {
        if let Err(err) = run_sql(&db, command, args.json) {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
        return;
    }

    repl(&db, &config, args.json);
}

fn init_logging(config: &Config) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn repl(db: &Database, config: &Config, json: bool) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("error: cannot start line editor: {err}");
            return;
        }
    };
    if let Some(history) = &config.shell.history_file {
        let _ = editor.load_history(history);
    }

    println!("quereus {} - type .help for help", env!("CARGO_PKG_VERSION"));
    let mut buffer = String::new();

    loop {
        let prompt = if buffer.is_empty() { "quereus> " } else { "    ...> " };
        match editor.readline(prompt) {
            Ok(line) => {
                let trimmed = line.trim();
                if buffer.is_empty() && trimmed.starts_with('.') {
                    let _ = editor.add_history_entry(trimmed);
                    if !dot_command(db, trimmed) {
                        break;
                    }
                    continue;
                }
                if !trimmed.is_empty() {
                    buffer.push_str(&line);
                    buffer.push('\n');
                }
                if trimmed.ends_with(';') {
                    let sql = std::mem::take(&mut buffer);
                    let _ = editor.add_history_entry(sql.trim());
                    if let Err(err) = run_sql(db, &sql, json) {
                        eprintln!("error: {err}");
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                buffer.clear();
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("error: {err}");
                break;
            }
        }
    }

    if let Some(history) = &config.shell.history_file {
        let _ = editor.save_history(history);
    }
}

fn run_sql(db: &Database, sql: &str, json: bool) -> Result<(), QuereusError> {
    let mut count = 0usize;
    for row in db.eval(sql, ())? {
        let row = row?;
        if json {
            match serde_json::to_string(row.values()) {
                Ok(line) => println!("{line}"),
                Err(err) => eprintln!("error: cannot render row as JSON: {err}"),
            }
        } else {
            let rendered: Vec<String> =
                row.values().iter().map(Value::to_display_string).collect();
            println!("{}", rendered.join("\t"));
        }
        count += 1;
    }
    if count == 0 && db.changes() > 0 {
        println!("({} rows changed)", db.changes());
    }
    Ok(())
}

/// Returns false when the shell should exit
fn dot_command(db: &Database, command: &str) -> bool {
    let mut parts = command.splitn(2, ' ');
    let name = parts.next().unwrap_or_default();
    let argument = parts.next().map(str::trim);

    match name {
        ".quit" | ".exit" => return false,
        ".help" => {
            println!(".tables          list tables");
            println!(".schema [table]  show table definitions");
            println!(".quit            exit the shell");
        }
        ".tables" => {
            for name in db.session().schema.read().table_names() {
                println!("{name}");
            }
        }
        ".schema" => {
            let schema = db.session().schema.read();
            let names = match argument {
                Some(table) => vec![table.to_string()],
                None => schema.table_names(),
            };
            for name in names {
                match schema.table(&name) {
                    Some(table) => {
                        let columns: Vec<String> = table
                            .columns
                            .iter()
                            .map(|c| format!("{} {}", c.name, c.declared_type))
                            .collect();
                        println!("{} ({})", table.name, columns.join(", "));
                    }
                    None => eprintln!("no such table: {name}"),
                }
            }
        }
        other => eprintln!("unknown command: {other} (try .help)"),
    }
    true
}
