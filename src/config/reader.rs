//! Reads scenario files into a runnable [`Scenario`].
//!
//! A scenario is declared across one or more sectioned files. The
//! reader merges them in order into one text, keeps a copy of that
//! text with the results for reproducibility, then walks the sections:
//! every `[kind:subtype]` header instantiates a module through the
//! [`ModuleRegistry`], every `key=value` line below it configures the
//! open object. When all objects are collected, cross references are
//! resolved (executions to hosts, clients, files and parsers) and
//! workload schedules are written into the execution timeouts.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::artifact::FileObject;
use crate::client::Client;
use crate::config::registry::ModuleRegistry;
use crate::config::syntax::{ConfigLine, classify_line, split_reference};
use crate::error::{AppError, AppResult, ConfigError};
use crate::host::Host;
use crate::pipeline::{LogProcessor, LogViewer, Parser};
use crate::scenario::execution::Execution;
use crate::scenario::{Scenario, ScenarioObjects};
use crate::tc::TrafficShaper;
use crate::workload::Workload;

/// Name of the merged scenario text stored in the results directory.
pub const SCENARIO_FILE_NAME: &str = "scenarioFile";

/// Read the scenario declared by `files`.
///
/// The merged text is written to `results_dir` before parsing, so even
/// a rejected scenario leaves behind what was attempted.
///
/// # Errors
///
/// Fails when a file cannot be read, the merged copy cannot be
/// written, a section or setting is invalid, or a reference does not
/// resolve.
pub fn read_scenario(
    name: &str,
    files: &[PathBuf],
    parallel: bool,
    time_limit: Duration,
    results_dir: PathBuf,
    registry: &ModuleRegistry,
) -> AppResult<Scenario> {
    let merged = merge_scenario_files(files)?;
    let target = results_dir.join(SCENARIO_FILE_NAME);
    fs::write(&target, &merged)
        .map_err(|source| AppError::config(ConfigError::WriteFile { path: target, source }))?;
    let parsed = parse_objects(&merged, registry)?;
    assemble(name, parallel, time_limit, results_dir, parsed, registry)
}

/// Concatenate the scenario files, each announced by a `# <path>` line
/// and with surrounding whitespace stripped per line.
fn merge_scenario_files(files: &[PathBuf]) -> AppResult<String> {
    let mut lines = Vec::new();
    for path in files {
        let content = fs::read_to_string(path).map_err(|source| {
            AppError::config(ConfigError::ReadFile {
                path: path.clone(),
                source,
            })
        })?;
        lines.push(format!("# {}", path.display()));
        for line in content.lines() {
            lines.push(line.trim().to_owned());
        }
    }
    let mut merged = lines.join("\n");
    merged.push('\n');
    Ok(merged)
}

/// Everything collected from the sections, before resolution.
#[derive(Default)]
struct ParsedObjects {
    hosts: Vec<Host>,
    clients: Vec<Client>,
    files: Vec<FileObject>,
    executions: Vec<Execution>,
    parsers: Vec<Parser>,
    processors: Vec<Box<dyn LogProcessor>>,
    viewers: Vec<Box<dyn LogViewer>>,
    workloads: Vec<Workload>,
}

/// The object whose section is currently being read.
enum OpenSection {
    Host(Box<Host>),
    Client(Box<Client>),
    File(Box<FileObject>),
    Execution(Box<Execution>),
    Parser(Box<Parser>),
    Processor(Box<dyn LogProcessor>),
    Viewer(Box<dyn LogViewer>),
    Workload(Box<Workload>),
}

fn parse_objects(merged: &str, registry: &ModuleRegistry) -> AppResult<ParsedObjects> {
    let mut parsed = ParsedObjects::default();
    let mut open: Option<OpenSection> = None;
    for raw in merged.lines() {
        match classify_line(raw).map_err(AppError::config)? {
            ConfigLine::Skip => {}
            ConfigLine::Section { kind, subtype } => {
                if let Some(section) = open.take() {
                    close_section(section, &mut parsed)?;
                }
                open = Some(open_section(
                    &kind,
                    &subtype,
                    parsed.executions.len(),
                    registry,
                )?);
            }
            ConfigLine::Assignment { key, value } => {
                let Some(section) = open.as_mut() else {
                    return Err(AppError::config(ConfigError::KeyOutsideSection { key }));
                };
                apply_assignment(section, &key, &value)?;
            }
        }
    }
    if let Some(section) = open.take() {
        close_section(section, &mut parsed)?;
    }
    Ok(parsed)
}

fn open_section(
    kind: &str,
    subtype: &str,
    next_number: usize,
    registry: &ModuleRegistry,
) -> AppResult<OpenSection> {
    match kind {
        "host" => Ok(OpenSection::Host(Box::new(Host::new(
            registry.host(subtype)?,
        )))),
        "client" => Ok(OpenSection::Client(Box::new(Client::new(
            registry.client(subtype)?,
        )))),
        "file" => Ok(OpenSection::File(Box::new(FileObject::new(
            registry.file(subtype)?,
        )))),
        "execution" if subtype.is_empty() => Ok(OpenSection::Execution(Box::new(Execution::new(
            next_number,
        )))),
        "parser" => Ok(OpenSection::Parser(Box::new(Parser::new(
            registry.parser(subtype)?,
        )))),
        "processor" => Ok(OpenSection::Processor(registry.processor(subtype)?)),
        "viewer" => Ok(OpenSection::Viewer(registry.viewer(subtype)?)),
        "workload" => Ok(OpenSection::Workload(Box::new(Workload::new(
            registry.workload(subtype)?,
        )))),
        _ => Err(AppError::config(ConfigError::UnknownObjectType {
            kind: kind.to_owned(),
            subtype: subtype.to_owned(),
        })),
    }
}

fn apply_assignment(section: &mut OpenSection, key: &str, value: &str) -> AppResult<()> {
    match section {
        OpenSection::Host(host) => host.parse_setting(key, value),
        OpenSection::Client(client) => client.parse_setting(key, value),
        OpenSection::File(file) => file.parse_setting(key, value),
        OpenSection::Execution(execution) => execution.parse_setting(key, value),
        OpenSection::Parser(parser) => parser.parse_setting(key, value),
        OpenSection::Processor(processor) => {
            if processor.parse_setting(key, value)? {
                Ok(())
            } else {
                Err(unknown_parameter("processor", processor.kind(), key))
            }
        }
        OpenSection::Viewer(viewer) => {
            if viewer.parse_setting(key, value)? {
                Ok(())
            } else {
                Err(unknown_parameter("viewer", viewer.kind(), key))
            }
        }
        OpenSection::Workload(workload) => workload.parse_setting(key, value),
    }
}

fn unknown_parameter(kind: &str, subtype: &str, key: &str) -> AppError {
    AppError::config(ConfigError::UnknownParameter {
        section: format!("{kind}:{subtype}"),
        key: key.to_owned(),
    })
}

fn duplicate_name(kind: &'static str, name: &str) -> AppError {
    AppError::config(ConfigError::DuplicateName {
        kind,
        name: name.to_owned(),
    })
}

/// Validate the finished section and file it. Closing an execution
/// expands its `multiply` into further numbered copies.
fn close_section(section: OpenSection, parsed: &mut ParsedObjects) -> AppResult<()> {
    match section {
        OpenSection::Host(boxed) => {
            let mut host = *boxed;
            host.check_settings()?;
            if parsed.hosts.iter().any(|other| other.name() == host.name()) {
                return Err(duplicate_name("host", host.name()));
            }
            parsed.hosts.push(host);
        }
        OpenSection::Client(boxed) => {
            let mut client = *boxed;
            client.check_settings()?;
            if parsed
                .clients
                .iter()
                .any(|other| other.name() == client.name())
            {
                return Err(duplicate_name("client", client.name()));
            }
            parsed.clients.push(client);
        }
        OpenSection::File(boxed) => {
            let mut file = *boxed;
            file.check_settings()?;
            if parsed.files.iter().any(|other| other.name() == file.name()) {
                return Err(duplicate_name("file", file.name()));
            }
            parsed.files.push(file);
        }
        OpenSection::Execution(boxed) => {
            let mut execution = *boxed;
            execution.check_settings()?;
            let copies = execution.multiply();
            parsed.executions.push(execution);
            for _ in 1..copies {
                let number = parsed.executions.len();
                let copy = match parsed.executions.last() {
                    Some(base) => base.duplicate(number),
                    None => break,
                };
                parsed.executions.push(copy);
            }
        }
        OpenSection::Parser(boxed) => {
            let mut parser = *boxed;
            parser.check_settings()?;
            if parsed
                .parsers
                .iter()
                .any(|other| other.name() == parser.name())
            {
                return Err(duplicate_name("parser", parser.name()));
            }
            parsed.parsers.push(parser);
        }
        OpenSection::Processor(mut processor) => {
            processor.check_settings()?;
            parsed.processors.push(processor);
        }
        OpenSection::Viewer(mut viewer) => {
            viewer.check_settings()?;
            parsed.viewers.push(viewer);
        }
        OpenSection::Workload(boxed) => {
            let mut workload = *boxed;
            workload.check_settings()?;
            parsed.workloads.push(workload);
        }
    }
    Ok(())
}

/// Resolve references and freeze the object graph into a [`Scenario`].
fn assemble(
    name: &str,
    parallel: bool,
    time_limit: Duration,
    results_dir: PathBuf,
    mut parsed: ParsedObjects,
    registry: &ModuleRegistry,
) -> AppResult<Scenario> {
    if parsed.executions.is_empty() {
        return Err(AppError::config(ConfigError::NoExecutions {
            scenario: name.to_owned(),
        }));
    }
    for client in &mut parsed.clients {
        client.resolve(registry)?;
    }
    let client_names: Vec<String> = parsed
        .clients
        .iter()
        .map(|client| client.name().to_owned())
        .collect();
    for workload in &mut parsed.workloads {
        workload.apply(&mut parsed.executions, &client_names)?;
    }
    let hosts: Vec<Arc<Host>> = parsed.hosts.into_iter().map(Arc::new).collect();
    let clients: Vec<Arc<Client>> = parsed.clients.into_iter().map(Arc::new).collect();
    let mut files: Vec<Arc<FileObject>> = parsed.files.into_iter().map(Arc::new).collect();
    let mut parsers: Vec<Arc<Parser>> = parsed.parsers.into_iter().map(Arc::new).collect();
    let mut executions = Vec::with_capacity(parsed.executions.len());
    for mut execution in parsed.executions {
        resolve_execution(
            &mut execution,
            &hosts,
            &clients,
            &mut files,
            &mut parsers,
            registry,
        )?;
        executions.push(Arc::new(execution));
    }
    let shapers = shapers_for(&hosts, registry)?;
    let objects = ScenarioObjects {
        hosts,
        clients,
        files,
        executions,
        parsers,
        processors: parsed.processors,
        viewers: parsed.viewers,
        shapers,
    };
    Ok(Scenario::new(
        name.to_owned(),
        parallel,
        time_limit,
        results_dir,
        objects,
    ))
}

fn unknown_name(kind: &'static str, name: &str) -> AppError {
    AppError::config(ConfigError::UnknownName {
        section: "execution".to_owned(),
        kind,
        name: name.to_owned(),
    })
}

/// Attach the named host, client, files and parsers to one execution.
///
/// The parser list is the first non-empty of: the execution's own
/// `parser` settings, the client's, the client subtype's default.
fn resolve_execution(
    execution: &mut Execution,
    hosts: &[Arc<Host>],
    clients: &[Arc<Client>],
    files: &mut Vec<Arc<FileObject>>,
    parsers: &mut Vec<Arc<Parser>>,
    registry: &ModuleRegistry,
) -> AppResult<()> {
    let host_name = execution.host_name().map(str::to_owned).ok_or_else(|| {
        AppError::config(ConfigError::MissingParameter {
            section: "execution".to_owned(),
            key: "host",
        })
    })?;
    let client_name = execution.client_name().map(str::to_owned).ok_or_else(|| {
        AppError::config(ConfigError::MissingParameter {
            section: "execution".to_owned(),
            key: "client",
        })
    })?;
    let host = hosts
        .iter()
        .find(|candidate| candidate.name() == host_name)
        .map(Arc::clone)
        .ok_or_else(|| unknown_name("host", &host_name))?;
    let client = clients
        .iter()
        .find(|candidate| candidate.name() == client_name)
        .map(Arc::clone)
        .ok_or_else(|| unknown_name("client", &client_name))?;
    let parser_chain: Vec<String> = if execution.parser_names().is_empty() {
        if client.parser_names().is_empty() {
            vec![client.default_parser().to_owned()]
        } else {
            client.parser_names().to_vec()
        }
    } else {
        execution.parser_names().to_vec()
    };
    let mut resolved_parsers = Vec::with_capacity(parser_chain.len());
    for parser_name in &parser_chain {
        resolved_parsers.push(resolve_parser(parser_name, parsers, registry)?);
    }
    let file_refs = execution.file_refs().to_vec();
    let mut attached = Vec::with_capacity(file_refs.len());
    for reference in &file_refs {
        attached.push(resolve_file(reference, files)?);
    }
    let mut remaining = attached.into_iter();
    let first = remaining.next().ok_or_else(|| {
        AppError::config(ConfigError::MissingParameter {
            section: "execution".to_owned(),
            key: "file",
        })
    })?;
    execution.resolve(host, client, first, resolved_parsers);
    for extra in remaining {
        execution.attach_file(extra);
    }
    Ok(())
}

/// A parser reference names either a parser object declared in the
/// scenario or a parser subtype. Subtype instances join the scenario
/// parser list under their subtype name, so repeated references share
/// one instance.
fn resolve_parser(
    name: &str,
    parsers: &mut Vec<Arc<Parser>>,
    registry: &ModuleRegistry,
) -> AppResult<Arc<Parser>> {
    if let Some(found) = parsers
        .iter()
        .find(|candidate| candidate.name() == name)
        .map(Arc::clone)
    {
        return Ok(found);
    }
    let plugin = match registry.parser(name) {
        Ok(plugin) => plugin,
        Err(ConfigError::UnknownObjectType { .. }) => {
            return Err(unknown_name("parser", name));
        }
        Err(source) => return Err(AppError::config(source)),
    };
    let mut parser = Parser::new(plugin);
    parser.check_settings()?;
    let shared = Arc::new(parser);
    parsers.push(Arc::clone(&shared));
    Ok(shared)
}

/// Resolve one `file` value: a declared file object's name, optionally
/// with `@<index>` or `@?` selecting one variant of a multi-variant
/// object. Selected variants are materialized and join the scenario
/// file list so they are staged and cleaned like declared files.
fn resolve_file(reference: &str, files: &mut Vec<Arc<FileObject>>) -> AppResult<Arc<FileObject>> {
    let (name, argument) = split_reference(reference);
    let base = files
        .iter()
        .find(|candidate| candidate.name() == name)
        .map(Arc::clone)
        .ok_or_else(|| unknown_name("file", name))?;
    let Some(argument) = argument.filter(|argument| !argument.is_empty()) else {
        return Ok(base);
    };
    let Some(count) = base.variants() else {
        return Err(AppError::config(ConfigError::SelectionUnsupported {
            kind: base.kind(),
            name: name.to_owned(),
        }));
    };
    if count == 0 {
        return Err(AppError::config(ConfigError::SelectionOutOfRange {
            name: name.to_owned(),
            argument: argument.to_owned(),
            count,
        }));
    }
    let index = if argument == "?" {
        rand::thread_rng().gen_range(0..count)
    } else {
        let index = argument.parse::<usize>().ok().ok_or_else(|| {
            AppError::config(ConfigError::SelectionSyntax {
                name: name.to_owned(),
                argument: argument.to_owned(),
            })
        })?;
        if index >= count {
            return Err(AppError::config(ConfigError::SelectionOutOfRange {
                name: name.to_owned(),
                argument: argument.to_owned(),
                count,
            }));
        }
        index
    };
    let variant = Arc::new(base.materialize(index)?);
    files.push(Arc::clone(&variant));
    Ok(variant)
}

/// One shaper per host whose settings name a traffic control module.
fn shapers_for(
    hosts: &[Arc<Host>],
    registry: &ModuleRegistry,
) -> AppResult<Vec<(Arc<Host>, Arc<dyn TrafficShaper>)>> {
    let mut shapers = Vec::new();
    for host in hosts {
        if let Some(module) = host.tc_settings().module() {
            let shaper: Arc<dyn TrafficShaper> = Arc::from(registry.shaper(module)?);
            shapers.push((Arc::clone(host), shaper));
        }
    }
    Ok(shapers)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "\
[host:test__]
name=node1
[client:test__]
name=seed
testTime=2
[file:none]
name=payload
[execution]
host=node1
client=seed
file=payload
seeder=yes
[processor:savehostname]
[viewer:htmlcollection]
";

    /// Writes `content` as a single scenario file in a fresh tempdir
    /// and reads it. The tempdir is returned to keep the results
    /// directory alive for assertions.
    fn read_single(content: &str) -> AppResult<(tempfile::TempDir, AppResult<Scenario>)> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("scenario.conf");
        fs::write(&path, content)?;
        let results = dir.path().join("results");
        fs::create_dir_all(&results)?;
        let registry = ModuleRegistry::with_builtins();
        let outcome = read_scenario(
            "demo",
            &[path],
            true,
            Duration::from_secs(30),
            results,
            &registry,
        );
        Ok((dir, outcome))
    }

    #[test]
    fn a_minimal_scenario_reads_and_resolves() -> AppResult<()> {
        let (_dir, outcome) = read_single(MINIMAL)?;
        let scenario = outcome?;
        if scenario.name() != "demo" || !scenario.parallel() {
            return Err(AppError::config("Scenario identity was lost"));
        }
        if scenario.time_limit() != Duration::from_secs(30) {
            return Err(AppError::config("Time limit was lost"));
        }
        if scenario.hosts().len() != 1
            || scenario.clients().len() != 1
            || scenario.files().len() != 1
        {
            return Err(AppError::config("Wrong object counts"));
        }
        if scenario.processors().len() != 1 || scenario.viewers().len() != 1 {
            return Err(AppError::config("Pipeline sections were dropped"));
        }
        let execution = scenario
            .executions()
            .first()
            .ok_or_else(|| AppError::config("No execution came out"))?;
        if execution.host()?.name() != "node1" || execution.client()?.name() != "seed" {
            return Err(AppError::config("Execution references resolved wrong"));
        }
        if !execution.is_seeder() {
            return Err(AppError::config("Seeder flag was lost"));
        }
        Ok(())
    }

    #[test]
    fn the_merged_copy_is_stored_with_provenance() -> AppResult<()> {
        let dir = tempfile::tempdir()?;
        let objects = dir.path().join("one.conf");
        fs::write(
            &objects,
            "[host:test__]\nname=node1\n[client:test__]\nname=seed\n[file:none]\nname=payload\n",
        )?;
        let runs = dir.path().join("two.conf");
        fs::write(&runs, "[execution]\nhost=node1\nclient=seed\nfile=payload\n")?;
        let results = dir.path().join("results");
        fs::create_dir_all(&results)?;
        let registry = ModuleRegistry::with_builtins();
        let scenario = read_scenario(
            "demo",
            &[objects, runs],
            true,
            Duration::from_secs(30),
            results,
            &registry,
        )?;
        let stored = fs::read_to_string(scenario.results_dir().join(SCENARIO_FILE_NAME))?;
        if !stored.starts_with("# ") {
            return Err(AppError::config("Merged copy lacks provenance"));
        }
        let first_at = stored
            .find("one.conf")
            .ok_or_else(|| AppError::config("First file not announced"))?;
        let second_at = stored
            .find("two.conf")
            .ok_or_else(|| AppError::config("Second file not announced"))?;
        if first_at >= second_at {
            return Err(AppError::config("Files were merged out of order"));
        }
        Ok(())
    }

    #[test]
    fn executions_fall_back_to_the_client_default_parser() -> AppResult<()> {
        let (_dir, outcome) = read_single(MINIMAL)?;
        let scenario = outcome?;
        let execution = scenario
            .executions()
            .first()
            .ok_or_else(|| AppError::config("No execution came out"))?;
        let kinds: Vec<&str> = execution
            .parsers()
            .iter()
            .map(|parser| parser.kind())
            .collect();
        if kinds != vec!["cpulog"] {
            return Err(AppError::config(format!(
                "Unexpected parser chain: {kinds:?}"
            )));
        }
        Ok(())
    }

    #[test]
    fn parser_subtype_references_share_one_instance() -> AppResult<()> {
        let (_dir, outcome) = read_single(
            "\
[host:test__]
name=node1
[client:test__]
name=seed
[file:none]
name=payload
[execution]
host=node1
client=seed
file=payload
parser=cpulog
[execution]
host=node1
client=seed
file=payload
parser=cpulog
",
        )?;
        let scenario = outcome?;
        if scenario.parsers().len() != 1 {
            return Err(AppError::config(format!(
                "Expected one cached parser, found {}",
                scenario.parsers().len()
            )));
        }
        let first = scenario
            .executions()
            .first()
            .and_then(|execution| execution.parsers().first().map(Arc::clone))
            .ok_or_else(|| AppError::config("First execution has no parser"))?;
        let second = scenario
            .executions()
            .get(1)
            .and_then(|execution| execution.parsers().first().map(Arc::clone))
            .ok_or_else(|| AppError::config("Second execution has no parser"))?;
        if !Arc::ptr_eq(&first, &second) {
            return Err(AppError::config("Subtype parser was instantiated twice"));
        }
        Ok(())
    }

    #[test]
    fn multiply_expands_into_numbered_copies() -> AppResult<()> {
        let (_dir, outcome) = read_single(
            "\
[host:test__]
name=node1
[client:test__]
name=leech
[file:none]
name=payload
[execution]
host=node1
client=leech
file=payload
multiply=3
[execution]
host=node1
client=leech
file=payload
seeder=yes
",
        )?;
        let scenario = outcome?;
        let numbers: Vec<usize> = scenario
            .executions()
            .iter()
            .map(|execution| execution.number())
            .collect();
        if numbers != vec![0, 1, 2, 3] {
            return Err(AppError::config(format!(
                "Unexpected execution numbers: {numbers:?}"
            )));
        }
        let seeders: Vec<bool> = scenario
            .executions()
            .iter()
            .map(|execution| execution.is_seeder())
            .collect();
        if seeders != vec![false, false, false, true] {
            return Err(AppError::config("Copies did not keep their settings"));
        }
        for execution in scenario.executions() {
            if execution.client()?.name() != "leech" {
                return Err(AppError::config("A copy lost its client"));
            }
        }
        Ok(())
    }

    #[test]
    fn workloads_write_offsets_at_read_time() -> AppResult<()> {
        let (_dir, outcome) = read_single(
            "\
[host:test__]
name=node1
[client:test__]
name=leech
[file:none]
name=payload
[execution]
host=node1
client=leech
file=payload
multiply=3
[workload:linear]
duration=6
",
        )?;
        let scenario = outcome?;
        let offsets: Vec<Duration> = scenario
            .executions()
            .iter()
            .map(|execution| execution.timeout())
            .collect();
        if offsets
            != vec![
                Duration::ZERO,
                Duration::from_secs(3),
                Duration::from_secs(6),
            ]
        {
            return Err(AppError::config(format!(
                "Unexpected schedule: {offsets:?}"
            )));
        }
        Ok(())
    }

    #[test]
    fn a_scenario_without_executions_is_rejected() -> AppResult<()> {
        let (_dir, outcome) = read_single("[host:test__]\nname=node1\n")?;
        match outcome {
            Err(AppError::Config(ConfigError::NoExecutions { .. })) => Ok(()),
            Err(other) => Err(AppError::config(format!("Wrong error: {other}"))),
            Ok(_) => Err(AppError::config("An empty scenario was accepted")),
        }
    }

    #[test]
    fn duplicate_object_names_are_rejected() -> AppResult<()> {
        let (_dir, outcome) =
            read_single("[host:test__]\nname=node1\n[host:test__]\nname=node1\n")?;
        match outcome {
            Err(AppError::Config(ConfigError::DuplicateName { kind: "host", .. })) => Ok(()),
            Err(other) => Err(AppError::config(format!("Wrong error: {other}"))),
            Ok(_) => Err(AppError::config("A name collision was accepted")),
        }
    }

    #[test]
    fn settings_before_any_section_are_rejected() -> AppResult<()> {
        let (_dir, outcome) = read_single("name=node1\n")?;
        match outcome {
            Err(AppError::Config(ConfigError::KeyOutsideSection { key })) => {
                if key == "name" {
                    Ok(())
                } else {
                    Err(AppError::config(format!("Wrong key reported: {key}")))
                }
            }
            Err(other) => Err(AppError::config(format!("Wrong error: {other}"))),
            Ok(_) => Err(AppError::config("A stray setting was accepted")),
        }
    }

    #[test]
    fn unknown_section_kinds_are_rejected() -> AppResult<()> {
        let (_dir, outcome) = read_single("[frobnicator:x]\nname=f\n")?;
        match outcome {
            Err(AppError::Config(ConfigError::UnknownObjectType { .. })) => Ok(()),
            Err(other) => Err(AppError::config(format!("Wrong error: {other}"))),
            Ok(_) => Err(AppError::config("An unknown section was accepted")),
        }
    }

    #[test]
    fn unresolved_references_are_rejected() -> AppResult<()> {
        let (_dir, outcome) = read_single(
            "\
[host:test__]
name=node1
[client:test__]
name=seed
[file:none]
name=payload
[execution]
host=ghost
client=seed
file=payload
",
        )?;
        match outcome {
            Err(AppError::Config(ConfigError::UnknownName {
                kind: "host", name, ..
            })) => {
                if name == "ghost" {
                    Ok(())
                } else {
                    Err(AppError::config(format!("Wrong name reported: {name}")))
                }
            }
            Err(other) => Err(AppError::config(format!("Wrong error: {other}"))),
            Ok(_) => Err(AppError::config("A ghost host was accepted")),
        }
    }

    #[test]
    fn variant_selection_needs_plugin_support() -> AppResult<()> {
        let (_dir, outcome) = read_single(
            "\
[host:test__]
name=node1
[client:test__]
name=seed
[file:none]
name=payload
[execution]
host=node1
client=seed
file=payload@0
",
        )?;
        match outcome {
            Err(AppError::Config(ConfigError::SelectionUnsupported { name, .. })) => {
                if name == "payload" {
                    Ok(())
                } else {
                    Err(AppError::config(format!("Wrong name reported: {name}")))
                }
            }
            Err(other) => Err(AppError::config(format!("Wrong error: {other}"))),
            Ok(_) => Err(AppError::config("A selection on a plain file was accepted")),
        }
    }

    #[test]
    fn an_empty_selection_argument_means_the_plain_file() -> AppResult<()> {
        let (_dir, outcome) = read_single(
            "\
[host:test__]
name=node1
[client:test__]
name=seed
[file:none]
name=payload
[execution]
host=node1
client=seed
file=payload@
",
        )?;
        let scenario = outcome?;
        if scenario.files().len() != 1 {
            return Err(AppError::config("A variant was materialized from nothing"));
        }
        Ok(())
    }

    #[test]
    fn hosts_with_traffic_control_get_a_shaper() -> AppResult<()> {
        let (_dir, outcome) = read_single(
            "\
[host:test__]
name=node1
tc=netem
tc_down=10mbit
[client:test__]
name=seed
[file:none]
name=payload
[execution]
host=node1
client=seed
file=payload
",
        )?;
        let scenario = outcome?;
        let Some((host, _)) = scenario.shapers().first() else {
            return Err(AppError::config("No shaper was attached"));
        };
        if host.name() != "node1" {
            return Err(AppError::config("The shaper landed on the wrong host"));
        }
        Ok(())
    }
}
