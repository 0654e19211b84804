mod support;

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::tempdir;

use support::{run_campaigner, write_file};

/// A cpu.log as the profiling loop writes it.
const CPU_LOG: &str = "12-03-15 10:00:00.0\n 1.0 100\n12-03-15 10:00:05.0\n 2.0 200\n";

/// Runs a real two-execution campaign with only the sidecar
/// processors, so a later reparse adds statistics and views fresh.
/// Returns the stored scenario results directory.
fn run_sidecar_campaign(dir: &Path) -> Result<PathBuf, String> {
    let scenario = dir.join("swarm.conf");
    write_file(
        &scenario,
        "[host:test__]\n\
         name=node1\n\
         behavior=immediate\n\
         \n\
         [client:test__]\n\
         name=peer\n\
         testTime=1\n\
         \n\
         [file:none]\n\
         name=payload\n\
         \n\
         [execution]\n\
         host=node1\n\
         client=peer\n\
         file=payload\n\
         seeder=yes\n\
         \n\
         [execution]\n\
         host=node1\n\
         client=peer\n\
         file=payload\n\
         \n\
         [processor:savehostname]\n\
         [processor:saveisseeder]\n\
         [processor:savetimeout]\n",
    )?;
    let campaign = dir.join("demo.conf");
    write_file(
        &campaign,
        &format!(
            "[scenario]\nname=swarm\nfile={}\ntimelimit=2\n",
            scenario.display()
        ),
    )?;
    let results = dir.join("results");
    fs::create_dir_all(&results).map_err(|err| format!("create results failed: {}", err))?;
    let args = vec![
        "run-campaign".to_owned(),
        "--results-dir".to_owned(),
        results.display().to_string(),
        campaign.display().to_string(),
    ];
    let output = run_campaigner(args, dir)?;
    if !output.status.success() {
        return Err(format!(
            "stdout: {}\nstderr: {}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    let campaign_dir = fs::read_dir(&results)
        .map_err(|err| format!("read results failed: {}", err))?
        .next()
        .ok_or_else(|| "The campaign left no results".to_owned())?
        .map_err(|err| format!("read results failed: {}", err))?
        .path();
    Ok(campaign_dir.join("scenarios").join("swarm"))
}

/// A hand-built minimal results tree for tests that only exercise the
/// module and argument handling of the reparse command.
fn seed_results_tree(dir: &Path) -> Result<(), String> {
    let exec = dir.join("executions").join("exec_0");
    let subdirs = [
        exec.join("logs"),
        exec.join("parsedLogs"),
        dir.join("processed"),
        dir.join("views"),
    ];
    for sub in subdirs {
        fs::create_dir_all(&sub)
            .map_err(|err| format!("create {} failed: {}", sub.display(), err))?;
    }
    write_file(&exec.join("logs").join("log.log"), "ran\n")?;
    write_file(&dir.join("processed").join("isSeeder_0"), "NO")?;
    write_file(&dir.join("processed").join("hostname_0"), "node1")?;
    Ok(())
}

#[test]
fn a_finished_run_can_be_reparsed_with_new_modules() -> Result<(), String> {
    let dir = tempdir().map_err(|err| format!("tempdir failed: {}", err))?;
    let stored = run_sidecar_campaign(dir.path())?;

    let args = vec![
        "reparse".to_owned(),
        "--parser".to_owned(),
        "cpulog".to_owned(),
        "--processor".to_owned(),
        "statistics".to_owned(),
        "--viewer".to_owned(),
        "htmlcollection".to_owned(),
        stored.display().to_string(),
    ];
    let output = run_campaigner(args, dir.path())?;
    if !output.status.success() {
        return Err(format!(
            "stdout: {}\nstderr: {}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    let processed = stored.join("processed");
    let leecher = fs::read_to_string(processed.join("stats.leecher"))
        .map_err(|err| format!("read stats.leecher failed: {}", err))?;
    if !leecher.starts_with("1 ") {
        return Err(format!("Unexpected stats.leecher: {leecher}"));
    }
    let seeder = fs::read_to_string(processed.join("stats.seeder"))
        .map_err(|err| format!("read stats.seeder failed: {}", err))?;
    if !seeder.starts_with("1 ") {
        return Err(format!("Unexpected stats.seeder: {seeder}"));
    }
    let html = fs::read_to_string(stored.join("views").join("collection.html"))
        .map_err(|err| format!("read collection.html failed: {}", err))?;
    if !html.contains("node1") {
        return Err("The rebuilt view lost the host names.".to_owned());
    }
    // Raw logs are input only; the reparse must leave them alone.
    let log = stored
        .join("executions")
        .join("exec_0")
        .join("logs")
        .join("log.log");
    if !log.is_file() {
        return Err("Reparsing disturbed the raw logs.".to_owned());
    }
    Ok(())
}

#[test]
fn role_filters_select_stored_executions() -> Result<(), String> {
    let dir = tempdir().map_err(|err| format!("tempdir failed: {}", err))?;
    let stored = run_sidecar_campaign(dir.path())?;
    let executions = stored.join("executions");
    for number in 0..2 {
        write_file(
            &executions
                .join(format!("exec_{number}"))
                .join("logs")
                .join("cpu.log"),
            CPU_LOG,
        )?;
    }

    let args = vec![
        "reparse".to_owned(),
        "--seeders".to_owned(),
        "--parser".to_owned(),
        "cpulog".to_owned(),
        stored.display().to_string(),
    ];
    let output = run_campaigner(args, dir.path())?;
    if !output.status.success() {
        return Err(format!(
            "stdout: {}\nstderr: {}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    // Execution 0 is the stored seeder, execution 1 the leecher.
    let parsed = |number: usize| {
        executions
            .join(format!("exec_{number}"))
            .join("parsedLogs")
            .join("cpu.data")
    };
    if !parsed(0).is_file() {
        return Err("The stored seeder was not reparsed.".to_owned());
    }
    if parsed(1).is_file() {
        return Err("The stored leecher was reparsed despite --seeders.".to_owned());
    }
    Ok(())
}

#[test]
fn the_role_filters_are_exclusive() -> Result<(), String> {
    let dir = tempdir().map_err(|err| format!("tempdir failed: {}", err))?;
    let args = vec![
        "reparse".to_owned(),
        "--seeders".to_owned(),
        "--leechers".to_owned(),
        "--parser".to_owned(),
        "cpulog".to_owned(),
        dir.path().display().to_string(),
    ];
    let output = run_campaigner(args, dir.path())?;
    if output.status.success() {
        return Err("Both role filters were accepted at once.".to_owned());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.contains("cannot be used with") {
        return Err(format!("Unexpected usage error: {stderr}"));
    }
    Ok(())
}

#[test]
fn named_parser_arguments_are_accepted() -> Result<(), String> {
    let dir = tempdir().map_err(|err| format!("tempdir failed: {}", err))?;
    let stored = dir.path().join("swarm-night");
    seed_results_tree(&stored)?;

    let args = vec![
        "reparse".to_owned(),
        "--parser".to_owned(),
        "cpulog".to_owned(),
        "--arg".to_owned(),
        "name=cpu-main".to_owned(),
        stored.display().to_string(),
    ];
    let output = run_campaigner(args, dir.path())?;
    if !output.status.success() {
        return Err(format!(
            "stdout: {}\nstderr: {}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(())
}

#[test]
fn an_unknown_module_setting_fails_the_reparse() -> Result<(), String> {
    let dir = tempdir().map_err(|err| format!("tempdir failed: {}", err))?;
    let stored = dir.path().join("swarm-night");
    seed_results_tree(&stored)?;

    let args = vec![
        "reparse".to_owned(),
        "--parser".to_owned(),
        "cpulog".to_owned(),
        "--arg".to_owned(),
        "interval=2".to_owned(),
        stored.display().to_string(),
    ];
    let output = run_campaigner(args, dir.path())?;
    if output.status.success() {
        return Err("An unknown parser setting was accepted.".to_owned());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.contains("interval") {
        return Err(format!("The error does not name the setting: {stderr}"));
    }
    Ok(())
}

#[test]
fn an_argument_before_any_object_is_refused() -> Result<(), String> {
    let dir = tempdir().map_err(|err| format!("tempdir failed: {}", err))?;
    let stored = dir.path().join("swarm-night");
    seed_results_tree(&stored)?;

    let args = vec![
        "reparse".to_owned(),
        "--arg".to_owned(),
        "peak=yes".to_owned(),
        "--parser".to_owned(),
        "cpulog".to_owned(),
        stored.display().to_string(),
    ];
    let output = run_campaigner(args, dir.path())?;
    if output.status.success() {
        return Err("A dangling --arg was accepted.".to_owned());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.contains("peak=yes") {
        return Err(format!("The error does not name the argument: {stderr}"));
    }
    Ok(())
}

#[test]
fn a_directory_without_results_is_skipped() -> Result<(), String> {
    let dir = tempdir().map_err(|err| format!("tempdir failed: {}", err))?;
    let empty = dir.path().join("not-results");
    fs::create_dir_all(&empty).map_err(|err| format!("create dir failed: {}", err))?;

    let args = vec![
        "reparse".to_owned(),
        "--parser".to_owned(),
        "cpulog".to_owned(),
        empty.display().to_string(),
    ];
    let output = run_campaigner(args, dir.path())?;
    if !output.status.success() {
        return Err(format!(
            "stdout: {}\nstderr: {}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(())
}
