use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use threadview_api::{
    AddGateRequest, AddPostRequest, NewActor, PostCounts, StoredEmbed, StoredImage, ThreadViewApi,
};
use threadview_core::{GateRule, Label, ThreadParams, RENDER_STACK_SIZE};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "tv")]
#[command(about = "Threadview operator CLI")]
struct Cli {
    #[arg(long, default_value = "./threadview.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Actor {
        #[command(subcommand)]
        command: ActorCommand,
    },
    Post {
        #[command(subcommand)]
        command: Box<PostCommand>,
    },
    Gate {
        #[command(subcommand)]
        command: GateCommand,
    },
    Block {
        #[command(subcommand)]
        command: EdgeCommand,
    },
    Mute {
        #[command(subcommand)]
        command: MuteCommand,
    },
    Follow {
        #[command(subcommand)]
        command: EdgeCommand,
    },
    List {
        #[command(subcommand)]
        command: ListCommand,
    },
    Label {
        #[command(subcommand)]
        command: LabelCommand,
    },
    Repo {
        #[command(subcommand)]
        command: RepoCommand,
    },
    Thread {
        #[command(subcommand)]
        command: ThreadCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum ActorCommand {
    Add(ActorAddArgs),
}

#[derive(Debug, Args)]
struct ActorAddArgs {
    #[arg(long)]
    did: String,
    #[arg(long)]
    handle: Option<String>,
    #[arg(long)]
    display_name: Option<String>,
    #[arg(long)]
    avatar_cid: Option<String>,
}

#[derive(Debug, Subcommand)]
enum PostCommand {
    Add(PostAddArgs),
    TakeDown(PostUriArgs),
    Counts(PostCountsArgs),
}

#[derive(Debug, Args)]
struct PostAddArgs {
    #[arg(long)]
    author: String,
    #[arg(long)]
    text: String,
    #[arg(long)]
    rkey: Option<String>,
    #[arg(long)]
    reply_to: Option<String>,
    #[arg(long = "mention")]
    mentions: Vec<String>,
    #[arg(long)]
    created_at: Option<String>,
    #[arg(long, default_value_t = false)]
    invalid_reply_root: bool,
    #[arg(long, default_value_t = false)]
    violates_thread_gate: bool,
    #[command(flatten)]
    embed: EmbedArgs,
}

/// At most one embed kind per post.
#[derive(Debug, Args)]
struct EmbedArgs {
    #[arg(long = "image-cid")]
    image_cids: Vec<String>,
    #[arg(long = "image-alt")]
    image_alts: Vec<String>,
    #[arg(long)]
    link_uri: Option<String>,
    #[arg(long, default_value = "")]
    link_title: String,
    #[arg(long, default_value = "")]
    link_description: String,
    #[arg(long)]
    link_thumb_cid: Option<String>,
    #[arg(long, requires = "quote_cid")]
    quote_uri: Option<String>,
    #[arg(long, requires = "quote_uri")]
    quote_cid: Option<String>,
}

#[derive(Debug, Args)]
struct PostUriArgs {
    #[arg(long)]
    uri: String,
}

#[derive(Debug, Args)]
struct PostCountsArgs {
    #[arg(long)]
    uri: String,
    #[arg(long, default_value_t = 0)]
    likes: i64,
    #[arg(long, default_value_t = 0)]
    reposts: i64,
    #[arg(long, default_value_t = 0)]
    replies: i64,
}

#[derive(Debug, Subcommand)]
enum GateCommand {
    Add(GateAddArgs),
}

#[derive(Debug, Args)]
struct GateAddArgs {
    #[arg(long)]
    post_uri: String,
    /// `mention`, `following`, or `list=<list uri>`.
    #[arg(long = "allow")]
    allow: Vec<String>,
    /// Restrict replies to the thread owner.
    #[arg(long, default_value_t = false, conflicts_with = "allow")]
    owner_only: bool,
}

#[derive(Debug, Subcommand)]
enum EdgeCommand {
    Add(EdgeArgs),
}

#[derive(Debug, Args)]
struct EdgeArgs {
    #[arg(long)]
    creator: String,
    #[arg(long)]
    subject: String,
}

#[derive(Debug, Subcommand)]
enum MuteCommand {
    Add(MuteAddArgs),
}

#[derive(Debug, Args)]
struct MuteAddArgs {
    #[arg(long)]
    muted_by: String,
    #[arg(long)]
    subject: String,
}

#[derive(Debug, Subcommand)]
enum ListCommand {
    Add(ListAddArgs),
    AddItem(ListAddItemArgs),
}

#[derive(Debug, Args)]
struct ListAddArgs {
    #[arg(long)]
    creator: String,
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "app.bsky.graph.defs#curatelist")]
    purpose: String,
}

#[derive(Debug, Args)]
struct ListAddItemArgs {
    #[arg(long)]
    list_uri: String,
    #[arg(long)]
    subject: String,
}

#[derive(Debug, Subcommand)]
enum LabelCommand {
    Add(LabelAddArgs),
}

#[derive(Debug, Args)]
struct LabelAddArgs {
    #[arg(long)]
    src: String,
    #[arg(long)]
    uri: String,
    #[arg(long)]
    val: String,
    #[arg(long)]
    cid: Option<String>,
    #[arg(long, default_value_t = false)]
    neg: bool,
}

#[derive(Debug, Subcommand)]
enum RepoCommand {
    SetRev(RepoSetRevArgs),
}

#[derive(Debug, Args)]
struct RepoSetRevArgs {
    #[arg(long)]
    did: String,
    #[arg(long)]
    rev: String,
}

#[derive(Debug, Subcommand)]
enum ThreadCommand {
    Show(ThreadShowArgs),
}

#[derive(Debug, Args)]
struct ThreadShowArgs {
    #[arg(long)]
    uri: String,
    #[arg(long)]
    viewer: Option<String>,
    #[arg(long)]
    depth: Option<u32>,
    #[arg(long)]
    parent_height: Option<u32>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let api = ThreadViewApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Actor { command: ActorCommand::Add(args) } => {
            let actor = api.add_actor(NewActor {
                did: args.did,
                handle: args.handle,
                display_name: args.display_name,
                avatar_cid: args.avatar_cid,
            })?;
            emit_json(serde_json::to_value(actor)?)
        }
        Command::Post { command } => run_post(*command, &api),
        Command::Gate { command: GateCommand::Add(args) } => run_gate_add(args, &api),
        Command::Block { command: EdgeCommand::Add(args) } => {
            emit_json(serde_json::to_value(api.add_block(&args.creator, &args.subject)?)?)
        }
        Command::Follow { command: EdgeCommand::Add(args) } => {
            emit_json(serde_json::to_value(api.add_follow(&args.creator, &args.subject)?)?)
        }
        Command::Mute { command: MuteCommand::Add(args) } => {
            api.add_mute(&args.muted_by, &args.subject)?;
            emit_json(serde_json::json!({
                "muted_by": args.muted_by,
                "subject": args.subject
            }))
        }
        Command::List { command } => run_list(command, &api),
        Command::Label { command: LabelCommand::Add(args) } => {
            let label = api.add_label(Label {
                src: args.src,
                uri: args.uri,
                cid: args.cid,
                val: args.val,
                neg: args.neg,
                cts: OffsetDateTime::now_utc().format(&Rfc3339)?,
            })?;
            emit_json(serde_json::to_value(label)?)
        }
        Command::Repo { command: RepoCommand::SetRev(args) } => {
            api.set_repo_rev(&args.did, &args.rev)?;
            emit_json(serde_json::json!({ "did": args.did, "rev": args.rev }))
        }
        Command::Thread { command: ThreadCommand::Show(args) } => run_thread_show(args, &api),
    }
}

fn run_db(command: DbCommand, api: &ThreadViewApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?)
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
    }
}

fn run_post(command: PostCommand, api: &ThreadViewApi) -> Result<()> {
    match command {
        PostCommand::Add(args) => {
            let embed = build_embed(args.embed)?;
            let created_at = args
                .created_at
                .as_deref()
                .map(|value| {
                    OffsetDateTime::parse(value, &Rfc3339)
                        .with_context(|| format!("invalid --created-at timestamp: {value}"))
                })
                .transpose()?;
            let post = api.add_post(AddPostRequest {
                author: args.author,
                text: args.text,
                rkey: args.rkey,
                reply_to: args.reply_to,
                mentions: args.mentions,
                embed,
                created_at,
                invalid_reply_root: args.invalid_reply_root,
                violates_thread_gate: args.violates_thread_gate,
            })?;
            emit_json(serde_json::to_value(post)?)
        }
        PostCommand::TakeDown(args) => {
            api.take_down(&args.uri)?;
            emit_json(serde_json::json!({ "uri": args.uri, "taken_down": true }))
        }
        PostCommand::Counts(args) => {
            let counts =
                PostCounts { likes: args.likes, reposts: args.reposts, replies: args.replies };
            api.set_counts(&args.uri, &counts)?;
            emit_json(serde_json::json!({ "uri": args.uri, "counts": counts }))
        }
    }
}

fn build_embed(args: EmbedArgs) -> Result<Option<StoredEmbed>> {
    let mut embeds = Vec::new();
    if !args.image_cids.is_empty() {
        if args.image_alts.len() > args.image_cids.len() {
            return Err(anyhow!("more --image-alt values than --image-cid values"));
        }
        let mut alts = args.image_alts.into_iter();
        let images = args
            .image_cids
            .into_iter()
            .map(|cid| StoredImage { cid, alt: alts.next().unwrap_or_default() })
            .collect();
        embeds.push(StoredEmbed::Images { images });
    }
    if let Some(uri) = args.link_uri {
        embeds.push(StoredEmbed::External {
            uri,
            title: args.link_title,
            description: args.link_description,
            thumb_cid: args.link_thumb_cid,
        });
    }
    if let (Some(uri), Some(cid)) = (args.quote_uri, args.quote_cid) {
        embeds.push(StoredEmbed::Record { uri, cid });
    }
    if embeds.len() > 1 {
        return Err(anyhow!("a post takes at most one embed kind"));
    }
    Ok(embeds.pop())
}

fn run_gate_add(args: GateAddArgs, api: &ThreadViewApi) -> Result<()> {
    let allow = if args.owner_only {
        Some(Vec::new())
    } else if args.allow.is_empty() {
        None
    } else {
        Some(args.allow.iter().map(String::as_str).map(parse_gate_rule).collect::<Result<Vec<_>>>()?)
    };
    let written = api.add_gate(AddGateRequest { post_uri: args.post_uri, allow })?;
    emit_json(serde_json::to_value(written)?)
}

fn parse_gate_rule(value: &str) -> Result<GateRule> {
    match value {
        "mention" => Ok(GateRule::Mention),
        "following" => Ok(GateRule::Following),
        other => other
            .strip_prefix("list=")
            .filter(|list| !list.is_empty())
            .map(|list| GateRule::List { list: list.to_string() })
            .ok_or_else(|| {
                anyhow!("unknown gate rule `{other}`; expected mention, following, or list=<uri>")
            }),
    }
}

fn run_list(command: ListCommand, api: &ThreadViewApi) -> Result<()> {
    match command {
        ListCommand::Add(args) => {
            emit_json(serde_json::to_value(api.add_list(&args.creator, &args.name, &args.purpose)?)?)
        }
        ListCommand::AddItem(args) => {
            emit_json(serde_json::to_value(api.add_list_item(&args.list_uri, &args.subject)?)?)
        }
    }
}

fn run_thread_show(args: ThreadShowArgs, api: &ThreadViewApi) -> Result<()> {
    api.migrate(false)?;
    let params = ThreadParams::new(args.uri, args.viewer, args.depth, args.parent_height)?;
    std::thread::scope(|scope| {
        std::thread::Builder::new()
            .name("thread-show".to_string())
            .stack_size(RENDER_STACK_SIZE)
            .spawn_scoped(scope, || show_thread(api, params))
            .context("failed to spawn render thread")?
            .join()
            .map_err(|_| anyhow!("render thread panicked"))?
    })
}

fn show_thread(api: &ThreadViewApi, params: ThreadParams) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let response = runtime.block_on(api.post_thread(params))?;
    emit_json(serde_json::json!({
        "thread": response.thread,
        "repo_rev": response.repo_rev
    }))
}
