//! Administrative command line for bucket databases.
#![forbid(unsafe_code)]

use std::error::Error;
use std::io::{self, Read};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use sombra_bucket::logging::init_logging;
use sombra_bucket::{
    BucketConfig, BucketError, BucketStore, FileConfig, FindOptions, GetOptions, IndexSpec,
    MutationOptions, PropertyType, Sort, SortOrder,
};

#[derive(Parser, Debug)]
#[command(
    name = "sombra-bucket",
    version,
    about = "Administrative CLI for sombra bucket databases",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, value_name = "FILE", help = "Config file to load")]
    config: Option<PathBuf>,

    #[arg(
        long,
        short = 'd',
        global = true,
        env = "SOMBRA_BUCKET_DB",
        value_name = "DB",
        help = "Database file (defaults to [database] default in the config)"
    )]
    database: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "RUST_LOG",
        default_value = "warn",
        help = "Log filter directive"
    )]
    log_level: String,

    #[arg(long, global = true, help = "Pretty-print JSON output")]
    pretty: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a bucket.
    CreateBucket(CreateBucketCmd),
    /// Delete a bucket and its objects.
    DeleteBucket {
        bucket: String,
    },
    /// List buckets.
    ListBuckets,
    /// Insert or replace an object.
    Put {
        bucket: String,
        key: String,
        #[arg(value_name = "JSON", help = "Document, or '-' to read stdin")]
        document: String,
    },
    /// Read an object.
    Get {
        bucket: String,
        key: String,
        #[arg(long, help = "Re-read bucket metadata")]
        no_bucket_cache: bool,
    },
    /// Delete an object.
    Del {
        bucket: String,
        key: String,
    },
    /// Query objects.
    Find(FindCmd),
    /// Set indexed fields on matching objects.
    UpdateMany {
        bucket: String,
        filter: String,
        #[arg(
            long = "set",
            value_name = "FIELD=JSON",
            required = true,
            help = "Field assignment, repeatable"
        )]
        set: Vec<String>,
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Delete matching objects.
    DeleteMany {
        bucket: String,
        filter: String,
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Widen a bucket's identifier column.
    Migrate {
        bucket: String,
    },
    /// Show a bucket's migration phase and sequence.
    MigrationStatus {
        bucket: String,
    },
    /// Set the next identifier the bucket's sequence hands out.
    RestartSequence {
        bucket: String,
        next_value: i64,
    },
}

#[derive(Args, Debug)]
struct CreateBucketCmd {
    bucket: String,

    #[arg(
        long = "index",
        value_name = "NAME:TYPE[:unique]",
        help = "Indexed property (type: string, number, boolean)"
    )]
    index: Vec<String>,

    #[arg(long, default_value_t = 0)]
    version: u32,
}

#[derive(Args, Debug)]
struct FindCmd {
    bucket: String,

    #[arg(default_value = "(_id=*)")]
    filter: String,

    #[arg(long, value_name = "ATTR")]
    sort: Option<String>,

    #[arg(long, requires = "sort")]
    desc: bool,

    #[arg(long)]
    limit: Option<u64>,

    #[arg(long, default_value_t = 0)]
    offset: u64,

    #[arg(long)]
    no_bucket_cache: bool,
}

fn parse_index(spec: &str) -> Result<(String, IndexSpec), String> {
    let mut parts = spec.split(':');
    let name = parts.next().filter(|n| !n.is_empty());
    let kind = parts.next();
    let flag = parts.next();
    let (Some(name), Some(kind)) = (name, kind) else {
        return Err(format!("index '{spec}' must look like NAME:TYPE[:unique]"));
    };
    let kind = match kind {
        "string" => PropertyType::String,
        "number" => PropertyType::Number,
        "boolean" => PropertyType::Boolean,
        other => return Err(format!("unknown property type '{other}'")),
    };
    let index = match (flag, parts.next()) {
        (None, None) => IndexSpec::new(kind),
        (Some("unique"), None) => IndexSpec::new(kind).unique(),
        _ => return Err(format!("index '{spec}' must look like NAME:TYPE[:unique]")),
    };
    Ok((name.to_owned(), index))
}

fn parse_assignment(text: &str) -> Result<(String, Value), String> {
    let (field, raw) = text
        .split_once('=')
        .ok_or_else(|| format!("assignment '{text}' must look like FIELD=JSON"))?;
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()));
    Ok((field.to_owned(), value))
}

fn read_document(arg: &str) -> Result<Value, Box<dyn Error>> {
    let text = if arg == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        arg.to_owned()
    };
    Ok(serde_json::from_str(&text)?)
}

fn run(cli: Cli) -> Result<Value, Box<dyn Error>> {
    init_logging(&cli.log_level)?;
    let file = FileConfig::load(cli.config)?;
    let db_path = cli
        .database
        .or_else(|| file.default_db_path().cloned())
        .ok_or("no database given; pass --database or set [database] default")?;
    let store = BucketStore::open(&db_path, file.store_options())?;

    let output = match cli.command {
        Command::CreateBucket(cmd) => {
            let mut config = BucketConfig::new().with_version(cmd.version);
            for spec in &cmd.index {
                let (name, index) = parse_index(spec)?;
                config = config.with_index(name, index);
            }
            serde_json::to_value(store.create_bucket(&cmd.bucket, &config)?)?
        }
        Command::DeleteBucket { bucket } => {
            store.delete_bucket(&bucket)?;
            json!({ "deleted": bucket })
        }
        Command::ListBuckets => serde_json::to_value(store.list_buckets()?)?,
        Command::Put {
            bucket,
            key,
            document,
        } => {
            let id = store.put(&bucket, &key, &read_document(&document)?)?;
            json!({ "key": key, "id": id })
        }
        Command::Get {
            bucket,
            key,
            no_bucket_cache,
        } => serde_json::to_value(store.get(&bucket, &key, GetOptions { no_bucket_cache })?)?,
        Command::Del { bucket, key } => {
            store.delete(&bucket, &key)?;
            json!({ "deleted": key })
        }
        Command::Find(cmd) => {
            let mut opts = FindOptions::default().offset(cmd.offset);
            if let Some(attribute) = cmd.sort {
                let order = if cmd.desc { SortOrder::Desc } else { SortOrder::Asc };
                opts = opts.sort(Sort { attribute, order });
            }
            if let Some(limit) = cmd.limit {
                opts = opts.limit(limit);
            }
            if cmd.no_bucket_cache {
                opts = opts.no_bucket_cache();
            }
            let records = store.find(&cmd.bucket, &cmd.filter, &opts)?.into_records()?;
            serde_json::to_value(records)?
        }
        Command::UpdateMany {
            bucket,
            filter,
            set,
            limit,
        } => {
            let mut fields = serde_json::Map::new();
            for assignment in &set {
                let (field, value) = parse_assignment(assignment)?;
                fields.insert(field, value);
            }
            let opts = MutationOptions {
                limit,
                ..MutationOptions::default()
            };
            json!({ "updated": store.update_many(&bucket, &fields, &filter, opts)? })
        }
        Command::DeleteMany {
            bucket,
            filter,
            limit,
        } => {
            let opts = MutationOptions {
                limit,
                ..MutationOptions::default()
            };
            json!({ "deleted": store.delete_many(&bucket, &filter, opts)? })
        }
        Command::Migrate { bucket } => {
            serde_json::to_value(store.migrate_identifier_column(&bucket)?)?
        }
        Command::MigrationStatus { bucket } => {
            serde_json::to_value(store.migration_status(&bucket)?)?
        }
        Command::RestartSequence { bucket, next_value } => {
            store.restart_identifier_sequence(&bucket, next_value)?;
            serde_json::to_value(store.sequence_state(&bucket)?)?
        }
    };
    Ok(output)
}

fn main() {
    let cli = Cli::parse();
    let pretty = cli.pretty;
    match run(cli) {
        Ok(output) => {
            let rendered = if pretty {
                serde_json::to_string_pretty(&output)
            } else {
                serde_json::to_string(&output)
            };
            match rendered {
                Ok(text) => println!("{text}"),
                Err(err) => {
                    eprintln!("error: {err}");
                    std::process::exit(1);
                }
            }
        }
        Err(err) => {
            match err.downcast_ref::<BucketError>() {
                Some(bucket_err) => eprintln!("error [{}]: {bucket_err}", bucket_err.code()),
                None => eprintln!("error: {err}"),
            }
            std::process::exit(1);
        }
    }
}
