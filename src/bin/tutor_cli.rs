use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use dev_tutor::{
    ai_utils::OpenAiModel,
    config::Config,
    course::{CompletionStore, SqliteCourseStore},
    db,
    teacher::{
        TutorSession, Tutor,
        controller::CheckOutcome,
        messages::Sender,
        relay::RelayEvent,
    },
    tool::{NewTool, list_tools, store_tool},
    user::{create_user, delete_user, get_user_list},
    utils::init_log,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::mpsc,
};

#[derive(Debug, clap::Parser)]
struct Args {
    #[command(subcommand)]
    command: Commands,
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
    /// Overrides `database.url`
    #[arg(short, long)]
    database: Option<String>,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    Login {
        id: i64,
        #[command(subcommand)]
        command: LoginCommand,
    },
}

#[derive(Debug, clap::Subcommand)]
enum UserCommand {
    List,
    Create {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        first_name: Option<String>,
    },
    Delete {
        id: i64,
    },
}

#[derive(Debug, clap::Subcommand)]
enum LoginCommand {
    ListTools,
    /// Store a generated tool from a JSON file
    ImportTool { file: PathBuf },
    ListCourses,
    Learn { tool_id: i64 },
}

#[tokio::main]
async fn main() {
    let _guard = init_log(None);
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("{:?}", e);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = Config::load(Some(args.config.as_path()))?;
    if let Some(database) = args.database {
        config.database.url = database;
    }
    let database = db::connect(&config.database.url).await?;

    match args.command {
        Commands::User { command } => match command {
            UserCommand::List => {
                for user in get_user_list(&database).await? {
                    println!("{:<8} {:<20} {}", user.id, user.username, user.display_name());
                }
            }
            UserCommand::Create {
                username,
                first_name,
            } => {
                let user = create_user(&database, username, first_name).await?;
                println!("User created with id: {}", user.id);
            }
            UserCommand::Delete { id } => {
                delete_user(&database, id).await?;
                println!("User deleted with id: {}", id);
            }
        },
        Commands::Login { id, command } => match command {
            LoginCommand::ListTools => {
                for tool in list_tools(&database, id).await? {
                    println!("{:<8} {:<24} {} modules", tool.id, tool.name, tool.modules.len());
                }
            }
            LoginCommand::ImportTool { file } => {
                let tool: NewTool = serde_json::from_str(&tokio::fs::read_to_string(&file).await?)?;
                let tool = store_tool(&database, id, tool).await?;
                println!("Tool stored with id: {}", tool.id);
            }
            LoginCommand::ListCourses => {
                let store = SqliteCourseStore::new(database.clone());
                for course in store.list_for_user(id).await? {
                    println!(
                        "{:<8} tool {:<8} {} modules completed",
                        course.id, course.tool_id, course.modules_completed
                    );
                }
            }
            LoginCommand::Learn { tool_id } => {
                let model = Arc::new(OpenAiModel::new(&config.llm));
                let store = Arc::new(SqliteCourseStore::new(database.clone()));
                let tutor = Tutor::new(model, store, database, &config);
                let session = tutor.open_session(id, tool_id).await?;
                start_learning(&tutor, session).await?;
            }
        },
    }
    Ok(())
}

/// Print announcements that arrived since `seen` messages were shown.
async fn print_announcements(session: &TutorSession, seen: &mut usize) -> anyhow::Result<()> {
    let messages = session.messages();
    let mut stdout = tokio::io::stdout();
    for message in messages.iter().skip(*seen) {
        if message.sender == Sender::Announcement {
            stdout
                .write_all(format!("\n[Tutor]:\n{}\n", message.text).as_bytes())
                .await?;
        }
    }
    stdout.flush().await?;
    *seen = messages.len();
    Ok(())
}

async fn start_learning(tutor: &Tutor, session: Arc<TutorSession>) -> anyhow::Result<()> {
    let mut seen = 0;
    let mut reader = BufReader::new(tokio::io::stdin());
    loop {
        print_announcements(&session, &mut seen).await?;
        println!("\n[Module {}] [Student]:", session.current_module());
        let mut input = String::new();
        if reader.read_line(&mut input).await? == 0 {
            break;
        }
        let input = input.trim();
        match input {
            "" => continue,
            "exit" => break,
            "check" => {
                match tutor.controller().check_now(&session).await {
                    CheckOutcome::Skipped => println!("Not enough new conversation to check yet."),
                    CheckOutcome::NotComplete(verdict) => println!(
                        "Module not complete yet (confidence {:.2}): {}",
                        verdict.confidence, verdict.summary
                    ),
                    CheckOutcome::Advanced { .. } => {}
                    CheckOutcome::StoreFailed(e) => println!("Could not save progress: {}", e),
                }
                continue;
            }
            _ => {}
        }

        let (tx, mut rx) = mpsc::channel(100);
        let printer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(b"\n[Tutor]:\n").await?;
            while let Some(event) = rx.recv().await {
                match event {
                    RelayEvent::Text(text) => stdout.write_all(text.as_bytes()).await?,
                    RelayEvent::Error(error) => {
                        stdout.write_all(format!("\n[Error]: {}", error).as_bytes()).await?
                    }
                    RelayEvent::Done => break,
                }
                stdout.flush().await?;
            }
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
            anyhow::Ok(())
        });
        let reply = tutor.chat(&session, input, tx).await;
        printer.await??;
        let reply = reply?;
        // everything up to the reply has been printed already
        if let Some(position) = session.messages().iter().position(|m| m.id == reply.id) {
            seen = seen.max(position + 1);
        }
    }
    tutor.close_session(session.key.user_id, session.key.tool_id).await;
    Ok(())
}
