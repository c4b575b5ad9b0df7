mod commands;
mod config;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use crate::commands::{
    cmd_import, cmd_match, cmd_nutrition, cmd_recipe_add_ingredient, cmd_recipe_create,
    cmd_recipe_import, cmd_recipe_list, cmd_review_bulk, cmd_review_confirm, cmd_review_override,
    cmd_review_pending, cmd_review_reject, cmd_review_scan, cmd_review_stats,
};
use crate::config::Config;
use larder_core::db::Database;
use larder_core::matcher::MatchStrategy;
use larder_core::review::{DEFAULT_PENDING_LIMIT, PendingFilter};
use larder_core::service::LarderService;

#[derive(Parser)]
#[command(
    name = "larder",
    version,
    about = "Match recipe ingredients to a nutrition dataset and compute per-serving nutrition"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a nutrition reference dataset (CSV, wide or long layout)
    Import {
        /// Path to the CSV file
        file: PathBuf,
        /// Write batch-NNN.json files and import-summary.md here
        #[arg(long, value_name = "DIR")]
        out_dir: Option<PathBuf>,
        /// Records per batch (default from larder.toml, else 1000)
        #[arg(long)]
        batch_size: Option<usize>,
        /// Parse and report without writing to the database
        #[arg(long)]
        dry_run: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Find canonical ingredients for a piece of recipe text
    Match {
        /// Ingredient text, e.g. "2 spsk olivenolie"
        text: String,
        /// Scan the whole dataset and keep the closest hit per tier
        #[arg(long)]
        ranked: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage recipes
    Recipe {
        #[command(subcommand)]
        command: RecipeCommands,
    },
    /// Review automatic matches
    Review {
        #[command(subcommand)]
        command: ReviewCommands,
    },
    /// Show per-serving nutrition for a recipe
    Nutrition {
        /// Recipe ID
        recipe_id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Start the review REST API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
    },
}

#[derive(Subcommand)]
enum RecipeCommands {
    /// Create a new recipe
    Create {
        /// Recipe name
        name: String,
        /// Number of servings this recipe makes
        #[arg(short, long, default_value = "1")]
        servings: f64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add an ingredient line to a recipe
    AddIngredient {
        /// Recipe ID
        recipe_id: String,
        /// Ingredient text as written in the recipe
        name: String,
        /// Amount
        amount: f64,
        /// Unit (g, kg, dl, spsk, tsk, stk, ...)
        unit: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Import a recipe from a Cooklang (.cook) file
    Import {
        /// Path to the .cook file
        file: PathBuf,
        /// Recipe name override (defaults to metadata title or filename)
        #[arg(long)]
        name: Option<String>,
        /// Servings override (defaults to metadata servings)
        #[arg(long)]
        servings: Option<f64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List all recipes
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ReviewCommands {
    /// Match every ingredient that has no decision yet
    Scan {
        /// Only this recipe
        #[arg(long)]
        recipe: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List ingredients awaiting review with their best suggestion
    Pending {
        /// Only this recipe
        #[arg(long)]
        recipe: Option<String>,
        /// Case-insensitive filter on the ingredient text
        #[arg(long)]
        search: Option<String>,
        /// Include ingredients whose suggestion was rejected
        #[arg(long)]
        include_rejected: bool,
        #[arg(long, default_value = "0")]
        offset: usize,
        #[arg(long, default_value_t = DEFAULT_PENDING_LIMIT)]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Confirm a match
    Confirm {
        /// Recipe ingredient ID
        ingredient_id: String,
        /// Canonical ingredient ID
        canonical_id: String,
        /// Confidence 0-100 (defaults to the matcher's score for this pair)
        #[arg(long)]
        confidence: Option<i64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Reject the suggestion for an ingredient
    Reject {
        /// Recipe ingredient ID
        ingredient_id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Pin an ingredient to a canonical record by hand
    Override {
        /// Recipe ingredient ID
        ingredient_id: String,
        /// Canonical ingredient ID
        canonical_id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Confirm many matches from a JSON file
    Bulk {
        /// JSON array of {recipe_ingredient_id, canonical_id, confidence}
        file: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show review progress
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("larder=info,larder_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Database::open(&config.db_path)?;

    let mut matcher = config.settings.matcher_config();
    if let Commands::Match { ranked: true, .. } = cli.command {
        matcher.strategy = MatchStrategy::Ranked;
    }
    let svc = LarderService::with_database(db, matcher);

    match cli.command {
        Commands::Import {
            file,
            out_dir,
            batch_size,
            dry_run,
            json,
        } => {
            // A dry run with nowhere to write still leaves the batches on disk.
            let out_dir = out_dir.or_else(|| dry_run.then(|| config.data_dir.join("import")));
            let batch_size = batch_size.unwrap_or(config.settings.batch_size);
            cmd_import(&svc, &file, out_dir.as_deref(), batch_size, dry_run, json)
        }
        Commands::Match { text, json, .. } => cmd_match(&svc, &text, json),
        Commands::Recipe { command } => match command {
            RecipeCommands::Create {
                name,
                servings,
                json,
            } => cmd_recipe_create(&svc, &name, servings, json),
            RecipeCommands::AddIngredient {
                recipe_id,
                name,
                amount,
                unit,
                json,
            } => cmd_recipe_add_ingredient(&svc, &recipe_id, &name, amount, &unit, json),
            RecipeCommands::Import {
                file,
                name,
                servings,
                json,
            } => cmd_recipe_import(&svc, &file, name, servings, json),
            RecipeCommands::List { json } => cmd_recipe_list(&svc, json),
        },
        Commands::Review { command } => match command {
            ReviewCommands::Scan { recipe, json } => {
                cmd_review_scan(&svc, recipe.as_deref(), json)
            }
            ReviewCommands::Pending {
                recipe,
                search,
                include_rejected,
                offset,
                limit,
                json,
            } => {
                let filter = PendingFilter {
                    recipe_id: recipe,
                    search,
                    include_rejected,
                    offset,
                    limit,
                };
                cmd_review_pending(&svc, &filter, json)
            }
            ReviewCommands::Confirm {
                ingredient_id,
                canonical_id,
                confidence,
                json,
            } => cmd_review_confirm(&svc, &ingredient_id, &canonical_id, confidence, json),
            ReviewCommands::Reject {
                ingredient_id,
                json,
            } => cmd_review_reject(&svc, &ingredient_id, json),
            ReviewCommands::Override {
                ingredient_id,
                canonical_id,
                json,
            } => cmd_review_override(&svc, &ingredient_id, &canonical_id, json),
            ReviewCommands::Bulk { file, json } => cmd_review_bulk(&svc, &file, json),
            ReviewCommands::Stats { json } => cmd_review_stats(&svc, json),
        },
        Commands::Nutrition { recipe_id, json } => cmd_nutrition(&svc, &recipe_id, json),
        Commands::Serve { port, bind } => server::start_server(svc, port, &bind).await,
    }
}
