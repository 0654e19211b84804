use std::fs;
use std::path::PathBuf;

use clap::{ArgMatches, CommandFactory, FromArgMatches};

use crate::args::{CampaignerArgs, Command, ReparseArgs, RunCampaignArgs};
use crate::campaign::{self, RunMode};
use crate::config::registry::ModuleRegistry;
use crate::error::{AppError, AppResult, ConfigError, ScenarioError};
use crate::pipeline::reparse::{ObjectRequest, ReparseRequest, RoleFilter};
use crate::shutdown::{setup_signal_shutdown_handler, shutdown_channel};

/// Results root used when `RESULTS_DIR` is unset or empty.
const DEFAULT_RESULTS_DIR: &str = "Results";

/// Parse the command line and run the selected subcommand to
/// completion on a fresh multi-thread runtime.
///
/// # Errors
///
/// Fails when arguments do not parse, the runtime cannot be built or
/// the subcommand itself fails.
pub fn run() -> AppResult<()> {
    let (args, matches) = parse_args()?;

    crate::logger::init_logging(args.verbose);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run_async(args, &matches))
}

fn parse_args() -> AppResult<(CampaignerArgs, ArgMatches)> {
    let matches = CampaignerArgs::command().get_matches();
    let args = CampaignerArgs::from_arg_matches(&matches)?;
    Ok((args, matches))
}

async fn run_async(args: CampaignerArgs, matches: &ArgMatches) -> AppResult<()> {
    match args.command {
        Command::RunCampaign(campaign_args) => run_campaigns(&campaign_args).await,
        Command::Reparse(reparse_args) => {
            let request =
                build_reparse_request(reparse_args, matches.subcommand_matches("reparse"))?;
            let registry = ModuleRegistry::with_builtins();
            crate::pipeline::reparse::run(&request, &registry)
        }
        Command::MuxServe => crate::mux::serve::run().await,
    }
}

const fn selected_mode(args: &RunCampaignArgs) -> RunMode {
    if args.check {
        RunMode::Check
    } else {
        RunMode::Real
    }
}

/// Run every campaign file in order. A failing campaign does not stop
/// the later ones; the tally is the overall result.
async fn run_campaigns(args: &RunCampaignArgs) -> AppResult<()> {
    let mode = selected_mode(args);
    let results_root = resolve_results_root(args.results_dir.as_deref())?;
    let (shutdown_tx, _shutdown_rx) = shutdown_channel();
    let signal_task = setup_signal_shutdown_handler(&shutdown_tx);
    let total = args.campaign_files.len();
    let mut failed = 0_usize;
    for path in &args.campaign_files {
        let outcome = campaign::run_campaign_file(path, &results_root, mode, &shutdown_tx).await;
        if let Err(error) = outcome {
            tracing::error!("Campaign file '{}' failed: {}", path.display(), error);
            failed = failed.saturating_add(1);
        }
    }
    signal_task.abort();
    if failed > 0 {
        return Err(AppError::scenario(ScenarioError::CampaignsFailed {
            failed,
            total,
        }));
    }
    Ok(())
}

/// An explicitly configured results root must already exist; the
/// default one is created on demand.
fn resolve_results_root(setting: Option<&str>) -> AppResult<PathBuf> {
    match setting.filter(|value| !value.is_empty()) {
        Some(value) => {
            let root = PathBuf::from(value);
            if !root.is_dir() {
                return Err(AppError::config(ConfigError::ResultsDirUnusable { path: root }));
            }
            Ok(root)
        }
        None => {
            let root = PathBuf::from(DEFAULT_RESULTS_DIR);
            if !root.is_dir() {
                fs::create_dir_all(&root).map_err(|source| {
                    AppError::config(ConfigError::CreateDir {
                        path: root.clone(),
                        source,
                    })
                })?;
            }
            Ok(root)
        }
    }
}

#[derive(Clone, Copy)]
enum ObjectKind {
    Parser,
    Processor,
    Viewer,
}

/// One requested pipeline object with its position on the command
/// line, so `--arg` can bind to whatever was named last.
struct Slot {
    index: usize,
    kind: ObjectKind,
    request: ObjectRequest,
}

fn build_reparse_request(
    args: ReparseArgs,
    sub: Option<&ArgMatches>,
) -> AppResult<ReparseRequest> {
    let ReparseArgs {
        leechers,
        seeders,
        parsers,
        processors,
        viewers,
        arguments,
        directories,
    } = args;
    let filter = if leechers {
        RoleFilter::Leechers
    } else if seeders {
        RoleFilter::Seeders
    } else {
        RoleFilter::Everyone
    };
    let mut objects = Vec::new();
    push_slots(&mut objects, sub, "parsers", parsers, ObjectKind::Parser);
    push_slots(
        &mut objects,
        sub,
        "processors",
        processors,
        ObjectKind::Processor,
    );
    push_slots(&mut objects, sub, "viewers", viewers, ObjectKind::Viewer);
    let argument_indices: Vec<usize> = sub
        .and_then(|matches| matches.indices_of("arguments"))
        .map_or_else(Vec::new, |indices| indices.collect());
    for (position, (key, value)) in arguments.into_iter().enumerate() {
        let Some(index) = argument_indices.get(position).copied() else {
            return Err(AppError::config(ConfigError::ArgumentWithoutObject {
                argument: format!("{key}={value}"),
            }));
        };
        let target = objects
            .iter_mut()
            .filter(|slot| slot.index < index)
            .max_by_key(|slot| slot.index);
        let Some(slot) = target else {
            return Err(AppError::config(ConfigError::ArgumentWithoutObject {
                argument: format!("{key}={value}"),
            }));
        };
        slot.request.arguments.push((key, value));
    }
    let mut parser_requests = Vec::new();
    let mut processor_requests = Vec::new();
    let mut viewer_requests = Vec::new();
    for slot in objects {
        match slot.kind {
            ObjectKind::Parser => parser_requests.push(slot.request),
            ObjectKind::Processor => processor_requests.push(slot.request),
            ObjectKind::Viewer => viewer_requests.push(slot.request),
        }
    }
    Ok(ReparseRequest {
        filter,
        parsers: parser_requests,
        processors: processor_requests,
        viewers: viewer_requests,
        directories,
    })
}

fn push_slots(
    objects: &mut Vec<Slot>,
    sub: Option<&ArgMatches>,
    id: &str,
    subtypes: Vec<String>,
    kind: ObjectKind,
) {
    let indices: Vec<usize> = sub
        .and_then(|matches| matches.indices_of(id))
        .map_or_else(Vec::new, |found| found.collect());
    for (position, subtype) in subtypes.into_iter().enumerate() {
        let index = indices.get(position).copied().unwrap_or(usize::MAX);
        objects.push(Slot {
            index,
            kind,
            request: ObjectRequest {
                subtype,
                arguments: Vec::new(),
            },
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> AppResult<(CampaignerArgs, ArgMatches)> {
        let matches = CampaignerArgs::command().try_get_matches_from(argv)?;
        let args = CampaignerArgs::from_arg_matches(&matches)?;
        Ok((args, matches))
    }

    fn reparse_request(argv: &[&str]) -> AppResult<ReparseRequest> {
        let (args, matches) = parse(argv)?;
        let Command::Reparse(reparse_args) = args.command else {
            return Err(AppError::config("Expected the reparse subcommand"));
        };
        build_reparse_request(reparse_args, matches.subcommand_matches("reparse"))
    }

    #[test]
    fn reparse_arguments_bind_to_the_latest_object() -> AppResult<()> {
        let request = reparse_request(&[
            "campaigner",
            "reparse",
            "--parser",
            "cpulog",
            "--arg",
            "interval=2",
            "--processor",
            "statistics",
            "--arg",
            "peak=yes",
            "--viewer",
            "htmlcollection",
            "results",
        ])?;
        let parser = request
            .parsers
            .first()
            .ok_or_else(|| AppError::config("Parser request missing"))?;
        if parser.subtype != "cpulog"
            || parser.arguments != vec![("interval".to_owned(), "2".to_owned())]
        {
            return Err(AppError::config("The first --arg bound wrong"));
        }
        let processor = request
            .processors
            .first()
            .ok_or_else(|| AppError::config("Processor request missing"))?;
        if processor.arguments != vec![("peak".to_owned(), "yes".to_owned())] {
            return Err(AppError::config("The second --arg bound wrong"));
        }
        let viewer = request
            .viewers
            .first()
            .ok_or_else(|| AppError::config("Viewer request missing"))?;
        if !viewer.arguments.is_empty() {
            return Err(AppError::config("The viewer stole an argument"));
        }
        if request.directories != vec![PathBuf::from("results")] {
            return Err(AppError::config("Directories were lost"));
        }
        if request.filter != RoleFilter::Everyone {
            return Err(AppError::config("Unexpected default filter"));
        }
        Ok(())
    }

    #[test]
    fn a_leading_arg_flag_is_rejected() -> AppResult<()> {
        let outcome = reparse_request(&[
            "campaigner",
            "reparse",
            "--arg",
            "peak=yes",
            "--parser",
            "cpulog",
            "results",
        ]);
        match outcome {
            Err(AppError::Config(ConfigError::ArgumentWithoutObject { .. })) => Ok(()),
            Err(other) => Err(AppError::config(format!("Wrong error: {other}"))),
            Ok(_) => Err(AppError::config("A dangling --arg was accepted")),
        }
    }

    #[test]
    fn role_filter_flags_are_exclusive() -> AppResult<()> {
        let request = reparse_request(&["campaigner", "reparse", "--seeders", "results"])?;
        if request.filter != RoleFilter::Seeders {
            return Err(AppError::config("The seeders filter was dropped"));
        }
        if parse(&["campaigner", "reparse", "--seeders", "--leechers", "results"]).is_ok() {
            return Err(AppError::config("Conflicting filters were accepted"));
        }
        Ok(())
    }

    #[test]
    fn check_and_nocheck_are_exclusive() -> AppResult<()> {
        let (args, _) = parse(&["campaigner", "run-campaign", "--check", "demo.conf"])?;
        let Command::RunCampaign(campaign_args) = args.command else {
            return Err(AppError::config("Expected the run-campaign subcommand"));
        };
        if selected_mode(&campaign_args) != RunMode::Check {
            return Err(AppError::config("--check did not select the check mode"));
        }
        if parse(&[
            "campaigner",
            "run-campaign",
            "--check",
            "--nocheck",
            "demo.conf",
        ])
        .is_ok()
        {
            return Err(AppError::config("Conflicting modes were accepted"));
        }
        Ok(())
    }

    #[test]
    fn the_default_mode_is_the_real_run() -> AppResult<()> {
        let (args, _) = parse(&["campaigner", "run-campaign", "demo.conf"])?;
        let Command::RunCampaign(campaign_args) = args.command else {
            return Err(AppError::config("Expected the run-campaign subcommand"));
        };
        if selected_mode(&campaign_args) != RunMode::Real {
            return Err(AppError::config("The default mode is not the real run"));
        }
        Ok(())
    }

    #[test]
    fn an_explicit_results_root_must_exist() -> AppResult<()> {
        let dir = tempfile::tempdir()?;
        let existing = dir.path().to_str().map(str::to_owned);
        let resolved = resolve_results_root(existing.as_deref())?;
        if !resolved.is_dir() {
            return Err(AppError::config("An existing root was rejected"));
        }
        let missing = dir.path().join("nowhere");
        let outcome = resolve_results_root(missing.to_str());
        match outcome {
            Err(AppError::Config(ConfigError::ResultsDirUnusable { .. })) => Ok(()),
            Err(other) => Err(AppError::config(format!("Wrong error: {other}"))),
            Ok(_) => Err(AppError::config("A missing root was accepted")),
        }
    }

    #[test]
    fn unknown_reparse_flags_are_rejected() -> AppResult<()> {
        if parse(&["campaigner", "reparse", "--frobnicate", "results"]).is_ok() {
            return Err(AppError::config("An unknown flag was accepted"));
        }
        Ok(())
    }
}
