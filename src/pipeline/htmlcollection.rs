//! Single-page HTML index over the processed results of a scenario.
//!
//! When every participating execution has a `hostname_<n>` sidecar the
//! page gets a table with one row per execution and one column per
//! numbered file family (`cpu.data_3.png` and `cpu.data_7.png` share
//! the `cpu.data_X.png` column). Files that fit no column are listed
//! under "Other data". Without hostnames the page degrades to the
//! flat list alone.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::syntax::format_seconds;
use crate::error::{AppError, AppResult, PipelineError};

use super::{ExecutionView, LogViewer, ScenarioView};

pub struct HtmlCollection;

#[must_use]
pub fn factory() -> Box<dyn LogViewer> {
    Box::new(HtmlCollection)
}

fn read_error(path: &Path, source: io::Error) -> AppError {
    AppError::pipeline(PipelineError::ReadLog {
        path: path.to_path_buf(),
        source,
    })
}

/// File names in `dir`, sorted. Subdirectories are not linkable and
/// are left out.
fn list_files(dir: &Path) -> AppResult<Vec<String>> {
    let mut names = Vec::new();
    let entries = fs::read_dir(dir).map_err(|source| read_error(dir, source))?;
    for entry in entries {
        let entry = entry.map_err(|source| read_error(dir, source))?;
        let file_type = entry
            .file_type()
            .map_err(|source| read_error(dir, source))?;
        if file_type.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Splits `name` into a column at the last `_<number>` whose tail is
/// empty or an extension, e.g. `cpu.data_12.png` at 12 becomes
/// `("cpu.data", ".png")`. The stem must be nonempty and digits that
/// merely start with the number do not count.
fn split_column(name: &str, number: usize) -> Option<(String, String)> {
    let token = format!("_{number}");
    let mut end = name.len();
    loop {
        let window = name.get(..end)?;
        let index = window.rfind(&token)?;
        if index >= 1 {
            if let Some(tail) = name.get(index.saturating_add(token.len())..) {
                if tail.is_empty() || tail.starts_with('.') {
                    return Some((window.get(..index)?.to_owned(), tail.to_owned()));
                }
            }
        }
        end = index;
    }
}

/// Href prefix from the view directory to the processed directory.
/// Sibling directories link relatively so the page survives being
/// copied elsewhere along with its results.
fn processed_href(processed_dir: &Path, view_dir: &Path) -> PathBuf {
    let siblings = processed_dir
        .parent()
        .zip(view_dir.parent())
        .is_some_and(|(left, right)| left == right);
    if siblings {
        if let Some(name) = processed_dir.file_name() {
            return Path::new("..").join(name);
        }
    }
    processed_dir.to_path_buf()
}

impl LogViewer for HtmlCollection {
    fn kind(&self) -> &'static str {
        "htmlcollection"
    }

    fn parse_setting(&mut self, _key: &str, _value: &str) -> AppResult<bool> {
        Ok(false)
    }

    fn check_settings(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn create_view(
        &self,
        scenario: &ScenarioView,
        processed_dir: &Path,
        view_dir: &Path,
    ) -> AppResult<()> {
        let participants: Vec<&ExecutionView> = scenario
            .executions()
            .iter()
            .filter(|execution| !execution.is_side_service())
            .collect();
        let grouped = participants.iter().all(|execution| {
            processed_dir
                .join(format!("hostname_{}", execution.number()))
                .is_file()
        });
        let mut other_files = list_files(processed_dir)?;
        let href = processed_href(processed_dir, view_dir);

        let mut html = String::new();
        write!(
            html,
            "<html><head><title>{0} : HTML collection output</title></head>\n<body><h1>{0}</h1><h3>Contents</h3>\n<table>\n",
            scenario.name()
        )?;
        if grouped {
            html.push_str("<tr><td><a href='#execs'>Executions</a></td></tr>\n");
            for execution in &participants {
                writeln!(
                    html,
                    "<tr><td><a href='#exec_{0}'>- Execution {0} @ {1}</a></td></tr>",
                    execution.number(),
                    execution.host_name()
                )?;
            }
        }
        html.push_str("<tr><td><a href='#other'>Other data</a></td></tr>\n</table>\n");

        if grouped {
            let mut columns = BTreeSet::new();
            for execution in &participants {
                let hostname_file = format!("hostname_{}", execution.number());
                other_files.retain(|name| name != &hostname_file);
                for name in &other_files {
                    if let Some(column) = split_column(name, execution.number()) {
                        columns.insert(column);
                    }
                }
            }
            html.push_str(
                "<h3><a name=\"execs\">Executions</a></h3>\n<table><thead><tr>\n<td>Execution number</td>\n<td>Host name</td>\n",
            );
            for (stem, ext) in &columns {
                writeln!(html, "<td>{stem}_X{ext}</td>")?;
            }
            html.push_str("</tr></thead><tbody>\n");
            for execution in &participants {
                write!(
                    html,
                    "<tr><td><a name='exec_{0}'>{0}</a></td><td>{1}</td>",
                    execution.number(),
                    execution.host_name()
                )?;
                for (stem, ext) in &columns {
                    let file_name = format!("{stem}_{}{ext}", execution.number());
                    let path = processed_dir.join(&file_name);
                    let Ok(metadata) = fs::metadata(&path) else {
                        html.push_str("<td></td>");
                        continue;
                    };
                    other_files.retain(|name| name != &file_name);
                    if metadata.len() == 0 {
                        html.push_str("<td></td>");
                    } else if stem.as_str() == "isSeeder" && ext.is_empty() {
                        html.push_str(if execution.is_seeder() {
                            "<td>YES</td>"
                        } else {
                            "<td>NO</td>"
                        });
                    } else if stem.as_str() == "timeout" && ext.is_empty() {
                        write!(html, "<td>{} s</td>", format_seconds(execution.timeout()))?;
                    } else {
                        write!(
                            html,
                            "<td><a href=\"{}/{file_name}\">{file_name}</a></td>",
                            href.display()
                        )?;
                    }
                }
                html.push_str("</tr>\n");
            }
            html.push_str("</tbody></table>\n");
        }

        html.push_str("<h3><a name=\"other\">Other data</a></h3>\n<ul>\n");
        for name in &other_files {
            let path = processed_dir.join(name);
            if fs::metadata(&path).map_or(0, |metadata| metadata.len()) == 0 {
                continue;
            }
            writeln!(html, "<li><a href=\"{}/{name}\">{name}</a></li>", href.display())?;
        }
        html.push_str("</ul>\n</body>\n</html>\n");

        let target = view_dir.join("collection.html");
        fs::write(&target, html).map_err(|source| {
            AppError::pipeline(PipelineError::WriteData {
                path: target,
                source,
            })
        })
    }
}
