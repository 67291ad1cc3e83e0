use std::fmt;
use std::sync::Arc;

use ide_core::model::{CourseId, LessonId, encode_user_token};
use ide_core::{Language, detect};
use services::{AppServices, Clock, Notice, SessionHandle, SessionObserver, SyncConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    MissingArg { name: &'static str },
    UnknownArg(String),
    InvalidCourseId { raw: String },
    InvalidDbUrl { raw: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::MissingArg { name } => write!(f, "missing {name}"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidCourseId { raw } => write!(f, "invalid --course value: {raw:?}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
        }
    }
}

impl std::error::Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p app -- session --course <id> [--user <token>]");
    eprintln!("                              [--api <url>] [--db <sqlite_url>]");
    eprintln!("  cargo run -p app -- detect <file>");
    eprintln!("  cargo run -p app -- token <email>");
    eprintln!();
    eprintln!("Session commands (stdin):");
    eprintln!("  lesson <id> | slide <n> | code <text> | save | status | quit");
    eprintln!("  In <text>, \\n stands for a newline.");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  IDE_API_URL, IDE_DB_URL, IDE_TICK_SECS, IDE_FLUSH_TICKS, RUST_LOG");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Session,
    Detect,
    Token,
}

impl Command {
    fn from_arg(arg: &str) -> Option<Self> {
        match arg {
            "session" => Some(Self::Session),
            "detect" => Some(Self::Detect),
            "token" => Some(Self::Token),
            _ => None,
        }
    }
}

struct SessionArgs {
    course_id: CourseId,
    user_token: String,
    api_url: Option<String>,
    db_url: Option<String>,
}

impl SessionArgs {
    fn parse(args: &mut impl Iterator<Item = String>) -> Result<Self, ArgsError> {
        let mut course_id = None;
        let mut user_token = "guest".to_owned();
        let mut api_url = None;
        let mut db_url = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--course" => {
                    let value = require_value(args, "--course")?;
                    let parsed = value
                        .parse::<CourseId>()
                        .map_err(|_| ArgsError::InvalidCourseId { raw: value.clone() })?;
                    course_id = Some(parsed);
                }
                "--user" => user_token = require_value(args, "--user")?,
                "--api" => api_url = Some(require_value(args, "--api")?),
                "--db" => {
                    let value = require_value(args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = Some(normalize_sqlite_url(value));
                }
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        Ok(Self {
            course_id: course_id.ok_or(ArgsError::MissingArg { name: "--course" })?,
            user_token,
            api_url,
            db_url,
        })
    }
}

fn single_arg(
    args: &mut impl Iterator<Item = String>,
    name: &'static str,
) -> Result<String, ArgsError> {
    let value = args.next().ok_or(ArgsError::MissingArg { name })?;
    if let Some(extra) = args.next() {
        return Err(ArgsError::UnknownArg(extra));
    }
    Ok(value)
}

fn normalize_sqlite_url(raw: String) -> String {
    if raw == "sqlite::memory:" || raw.starts_with("sqlite://") {
        return raw;
    }

    let trimmed = raw.trim().to_string();
    let path_str = trimmed
        .strip_prefix("sqlite:")
        .unwrap_or(trimmed.as_str())
        .to_string();
    let path = std::path::Path::new(&path_str);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from("."))
            .join(path)
    };
    format!("sqlite://{}", absolute.display())
}

fn prepare_sqlite_file(db_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    if db_url == "sqlite::memory:" {
        return Ok(());
    }

    let path = db_url
        .strip_prefix("sqlite://")
        .ok_or_else(|| ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        })?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        return Err(ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        }
        .into());
    }

    let path = std::path::Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if !path.exists() {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
    }

    Ok(())
}

struct StdoutObserver;

impl SessionObserver for StdoutObserver {
    fn on_notice(&self, notice: &Notice) {
        println!("[{:?}] {notice}", notice.level);
    }
}

fn print_status(handle: &SessionHandle) {
    let cursor = handle.cursor();
    let identity = handle.identity();
    let course = handle.course();
    let slide = course
        .slide(cursor.lesson_id(), cursor.slide_index())
        .map_or("-", |s| s.title.as_str());
    println!(
        "{} ({}) | {} | lesson {} slide {} [{}] | {} min tracked",
        identity.display_name(),
        identity.initials(),
        course.title(),
        cursor.lesson_id(),
        cursor.slide_index(),
        slide,
        handle.tracker().elapsed().as_secs() / 60,
    );
    println!("{}", cursor.code());
}

/// Apply one stdin line. Returns false on `quit`.
async fn dispatch(handle: &SessionHandle, line: &str) -> bool {
    let (verb, rest) = line
        .trim()
        .split_once(' ')
        .map_or((line.trim(), ""), |(v, r)| (v, r.trim()));

    let result = match verb {
        "" => Ok(()),
        "quit" | "exit" => return false,
        "status" => {
            print_status(handle);
            Ok(())
        }
        "lesson" => match rest.parse::<LessonId>() {
            Ok(id) => handle.select_lesson(&id),
            Err(err) => {
                eprintln!("{err}");
                Ok(())
            }
        },
        "slide" => match rest.parse::<usize>() {
            Ok(index) => handle.select_slide(index),
            Err(_) => {
                eprintln!("slide expects a number, got {rest:?}");
                Ok(())
            }
        },
        "code" => handle.update_code(rest.replace("\\n", "\n")),
        "save" => handle.save().await.map(|outcome| {
            tracing::debug!(?outcome, "save finished");
        }),
        other => {
            eprintln!("unknown command: {other}");
            Ok(())
        }
    };

    if let Err(err) = result {
        eprintln!("{err}");
    }
    true
}

async fn run_session(args: SessionArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = SyncConfig::from_env()?;
    if let Some(api_url) = &args.api_url {
        config = config.with_api_url(api_url)?;
    }
    if let Some(db_url) = args.db_url {
        config = config.with_db_url(db_url);
    } else {
        config.db_url = normalize_sqlite_url(config.db_url);
    }

    // Create the SQLite file up front so the pool can open it.
    prepare_sqlite_file(&config.db_url)?;
    let services =
        AppServices::connect(config, Clock::default_clock(), Some(Arc::new(StdoutObserver))).await?;
    let handle = services
        .controller()
        .mount_session(&args.course_id, &args.user_token)
        .await?;
    print_status(&handle);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !dispatch(&handle, &line).await {
            break;
        }
    }

    handle.unmount();
    Ok(())
}

fn run_detect(path: &str) -> Result<Language, Box<dyn std::error::Error>> {
    let source = std::fs::read_to_string(path)?;
    Ok(detect(&source))
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut argv = std::env::args().skip(1);

    let cmd = match argv.next() {
        None => {
            print_usage();
            return Err(ArgsError::MissingArg { name: "subcommand" }.into());
        }
        Some(first) if first == "--help" || first == "-h" => {
            print_usage();
            return Ok(());
        }
        Some(first) => Command::from_arg(&first).ok_or_else(|| {
            print_usage();
            ArgsError::UnknownArg(first.clone())
        })?,
    };

    match cmd {
        Command::Session => {
            let args = SessionArgs::parse(&mut argv).map_err(|e| {
                eprintln!("{e}");
                print_usage();
                e
            })?;
            run_session(args).await
        }
        Command::Detect => {
            let path = single_arg(&mut argv, "<file>")?;
            println!("{}", run_detect(&path)?);
            Ok(())
        }
        Command::Token => {
            let email = single_arg(&mut argv, "<email>")?;
            println!("{}", encode_user_token(email.trim()));
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run().await {
        // At this layer (binary glue), printing once is fine.
        eprintln!("{err}");
        std::process::exit(2);
    }
}
