use std::{io::Read, path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use futures_util::StreamExt;

use abapgen_core_sdk::{
    config::Settings,
    db,
    generation::{stream_generation, GenerationEvent},
    llm,
    manager::ProviderManager,
    models::{AICallConfig, ConnectionStatus, ProviderName},
    prompts::{PromptRequest, QuestionAnswer},
    sanitize::sanitize_json_response,
    server, telemetry,
    validate::{validate_response, TaskKind, ValidationPolicy, ValidationReport},
};

/**
 * \brief CLI 程序入口。
 */
#[derive(Parser, Debug)]
#[command(name = "abapgen", version, about = "ABAP / functional spec / debug assistant")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 管理已保存的 Provider。
    Provider {
        #[command(subcommand)]
        action: ProviderCommand,
    },

    /**
     * \brief 根据 JSON 请求文件生成结果，流式输出 token 后打印校验报告。
     * \details 请求文件形如 {"task":"abap","style":"oo","form":{...}}。
     */
    Generate {
        #[command(flatten)]
        user: UserArg,
        #[arg(long)]
        request: PathBuf,
        /// 上一轮问答（JSON 数组 [{pergunta, resposta}]），提供即为精炼轮次
        #[arg(long)]
        answers: Option<PathBuf>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        temperature: Option<f32>,
    },

    /// 从标准输入读取模型原始输出，打印清洗结果与校验报告。
    Sanitize {
        #[arg(long, value_enum, default_value_t = TaskArg::Abap)]
        task: TaskArg,
        #[arg(long, default_value_t = false)]
        refinement: bool,
    },

    /**
     * \brief 启动本地 HTTP 服务。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:8787")]
        addr: String,
    },
}

#[derive(Args, Debug)]
struct UserArg {
    #[arg(long = "user", default_value = "local")]
    user_id: String,
}

#[derive(Subcommand, Debug)]
enum ProviderCommand {
    Add {
        #[command(flatten)]
        user: UserArg,
        #[arg(long)]
        provider: ProviderName,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value_t = false)]
        default: bool,
    },
    List {
        #[command(flatten)]
        user: UserArg,
    },
    Remove {
        #[command(flatten)]
        user: UserArg,
        #[arg(long)]
        id: i64,
    },
    Default {
        #[command(flatten)]
        user: UserArg,
        #[arg(long)]
        id: i64,
    },
    /// 探测已保存的 Provider；不指定 id 时探测当前解析结果（含免费默认）。
    Test {
        #[command(flatten)]
        user: UserArg,
        #[arg(long)]
        id: Option<i64>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TaskArg {
    Abap,
    FunctionalSpec,
    Debug,
}

impl From<TaskArg> for TaskKind {
    fn from(arg: TaskArg) -> Self {
        match arg {
            TaskArg::Abap => TaskKind::Abap,
            TaskArg::FunctionalSpec => TaskKind::FunctionalSpec,
            TaskArg::Debug => TaskKind::Debug,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env();
    telemetry::init(&settings);

    match cli.command {
        Commands::Provider { action } => run_provider(action, &settings).await?,
        Commands::Generate {
            user,
            request,
            answers,
            model,
            temperature,
        } => {
            let raw = std::fs::read_to_string(&request)
                .with_context(|| format!("read request file {} failed", request.display()))?;
            let mut prompt: PromptRequest =
                serde_json::from_str(&raw).context("parse request file failed")?;
            if let Some(path) = answers {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("read answers file {} failed", path.display()))?;
                let answers: Vec<QuestionAnswer> =
                    serde_json::from_str(&raw).context("parse answers file failed")?;
                prompt = prompt.with_answers(answers);
            }
            let config = AICallConfig {
                model,
                temperature,
                ..Default::default()
            };

            let store = db::SqliteStore::open(&settings.db_path).context("open database failed")?;
            let manager = ProviderManager::new(user.user_id, Arc::new(store), &settings);
            let resolved = manager.initialize().await;
            eprintln!(
                "provider: {} / {}{}",
                resolved.vendor(),
                resolved.model(),
                if resolved.is_default() { " (default)" } else { "" }
            );
            telemetry::log_event(
                "cli",
                &format!("generate task={} refinement={}", prompt.task_kind().as_str(), prompt.is_refinement()),
            );

            let manager = Arc::new(manager);
            let mut events = stream_generation(manager.clone(), prompt, config);
            let mut valid = true;
            let mut failure = None;
            while let Some(event) = events.next().await {
                match event {
                    GenerationEvent::Token { content } => {
                        eprint!("{}", content);
                    }
                    GenerationEvent::Done { result } => {
                        eprintln!();
                        println!("{}", serde_json::to_string_pretty(&result)?);
                        valid = result.is_valid;
                    }
                    GenerationEvent::Error { message } => {
                        eprintln!();
                        failure = Some(message);
                    }
                }
            }
            manager.flush_usage().await;
            if let Some(message) = failure {
                bail!("generation failed: {}", message);
            }
            if !valid {
                std::process::exit(2);
            }
        }
        Commands::Sanitize { task, refinement } => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("read stdin failed")?;
            let policy = if refinement {
                ValidationPolicy::refinement(task.into())
            } else {
                ValidationPolicy::initial(task.into())
            };
            println!("{}", sanitize_json_response(&raw));
            let report = ValidationReport::from(&validate_response(&raw, policy));
            eprintln!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Serve { addr } => {
            server::run(&addr, settings).await?;
        }
    }

    Ok(())
}

async fn run_provider(action: ProviderCommand, settings: &Settings) -> Result<()> {
    let conn = db::open(&settings.db_path).context("open database failed")?;
    match action {
        ProviderCommand::Add {
            user,
            provider,
            api_key,
            model,
            default,
        } => {
            let id = db::insert_provider(
                &conn,
                &db::NewProvider {
                    user_id: user.user_id.clone(),
                    provider_name: provider,
                    api_key,
                    model_name: model,
                    is_default: default,
                    is_active: true,
                },
            )
            .context("save provider failed")?;
            telemetry::log_event("cli", &format!("provider add id={} provider={}", id, provider));
            println!("Saved provider id={} ({})", id, provider);
        }
        ProviderCommand::List { user } => {
            let providers = db::list_providers(&conn, &user.user_id).context("list providers failed")?;
            if providers.is_empty() {
                println!("No providers configured; the free default ({}) will be used.", settings.default_provider.provider);
            }
            for p in providers {
                println!(
                    "{}{:>4}  {:<10} {:<32} {}",
                    if p.is_default { "*" } else { " " },
                    p.id,
                    p.provider_name,
                    p.effective_model(),
                    if p.is_active { "active" } else { "inactive" }
                );
            }
        }
        ProviderCommand::Remove { user, id } => {
            db::delete_provider(&conn, &user.user_id, id).context("remove provider failed")?;
            println!("Removed provider id={}", id);
        }
        ProviderCommand::Default { user, id } => {
            db::set_default_provider(&conn, &user.user_id, id).context("set default failed")?;
            println!("Default provider id={}", id);
        }
        ProviderCommand::Test { user, id } => {
            let status = match id {
                Some(id) => {
                    let provider = db::get_provider(&conn, id)?
                        .filter(|p| p.user_id == user.user_id)
                        .with_context(|| format!("provider id {} not found", id))?;
                    match llm::create_client(
                        provider.provider_name,
                        provider.api_key.clone(),
                        Some(provider.effective_model()),
                        &settings.endpoints,
                    ) {
                        Ok(client) => client.test_connection().await,
                        Err(err) => ConnectionStatus {
                            success: false,
                            message: err.to_string(),
                        },
                    }
                }
                None => {
                    let store = db::SqliteStore::open(&settings.db_path)?;
                    ProviderManager::new(user.user_id, Arc::new(store), settings)
                        .test_connection()
                        .await
                }
            };
            println!("{} {}", if status.success { "OK" } else { "FAIL" }, status.message);
            if !status.success {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
