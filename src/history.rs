//! Resolving the commit graph and driving one import run.
//!
//! The first pass walks the candidate versions oldest-first: versions
//! whose tag already exists are recorded as resolved, everything else
//! is fetched, unpacked and linked to its nearest predecessor from the
//! changelog. The second pass turns the predecessor forest into an
//! emission order in which every parent precedes its children, and
//! refuses to proceed when the changelog chains loop.

use crate::changelog;
use crate::fastimport::{self, Emitter};
use crate::snapshot;
use crate::source::SourcePackage;
use crate::tags;
use crate::unpack;
use crate::RunContext;
use debversion::Version;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;

#[derive(Debug)]
pub enum Error {
    Snapshot(snapshot::Error),
    Unpack(unpack::Error),
    Emit(fastimport::Error),
    /// The predecessor chain revisits a version: a broken changelog.
    Loop { version: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Snapshot(e) => write!(f, "{}", e),
            Error::Unpack(e) => write!(f, "{}", e),
            Error::Emit(e) => write!(f, "{}", e),
            Error::Loop { version } => {
                write!(f, "Changelog loop detected at {}", version)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<snapshot::Error> for Error {
    fn from(e: snapshot::Error) -> Self {
        Error::Snapshot(e)
    }
}

impl From<unpack::Error> for Error {
    fn from(e: unpack::Error) -> Self {
        Error::Unpack(e)
    }
}

impl From<fastimport::Error> for Error {
    fn from(e: fastimport::Error) -> Self {
        Error::Emit(e)
    }
}

/// What the first pass learned about one candidate version.
pub enum Probe {
    /// Its tag already resolves in the host repository.
    AlreadyImported(String),
    /// Fetched and unpacked; these are its changelog entry versions,
    /// newest first (empty when the changelog is broken).
    Imported { entries: Vec<Version> },
    /// The archive has no source for it.
    Missing,
}

/// The computed emission plan. Everything is keyed by canonical
/// version strings.
#[derive(Debug)]
pub struct Plan {
    /// Versions to emit, parents before children.
    pub order: Vec<String>,
    /// Version → nearest predecessor still in the working set.
    pub prev: HashMap<String, String>,
    /// Versions inside the depth window.
    pub in_window: HashSet<String>,
    /// Versions whose tag pre-existed, with their commit ids.
    pub resolved: HashMap<String, String>,
    /// The newest present version; the main branch tip after the run.
    pub newest: Option<String>,
}

/// Build the emission plan over `versions` (newest-first, skips
/// already removed). `probe` is called once per version inside the
/// depth window, oldest first.
pub fn build_plan<F>(
    versions: &[Version],
    depth: Option<usize>,
    skip: &HashSet<String>,
    mut probe: F,
) -> Result<Plan, Error>
where
    F: FnMut(&Version) -> Result<Probe, Error>,
{
    let window_size = depth.unwrap_or(versions.len()).min(versions.len());
    let window: Vec<Version> = versions[..window_size].to_vec();
    let in_window: HashSet<String> = window.iter().map(|v| v.to_string()).collect();
    let mut working_set: HashSet<String> = versions.iter().map(|v| v.to_string()).collect();

    let mut resolved: HashMap<String, String> = HashMap::new();
    let mut prev: HashMap<String, String> = HashMap::new();
    let mut successors: HashMap<String, Vec<String>> = HashMap::new();
    let mut initial: Vec<String> = vec![];
    let mut fetched: Vec<String> = vec![];

    for version in window.iter().rev() {
        let vs = version.to_string();
        let entries = match probe(version)? {
            Probe::AlreadyImported(commit) => {
                log::debug!("{} already imported as {}", vs, commit);
                resolved.insert(vs, commit);
                continue;
            }
            Probe::Missing => {
                log::warn!("no source found for {}; dropping it", vs);
                working_set.remove(&vs);
                // Anything that linked to it becomes a cut point.
                if let Some(orphans) = successors.remove(&vs) {
                    for orphan in &orphans {
                        prev.remove(orphan);
                    }
                    initial.extend(orphans);
                }
                continue;
            }
            Probe::Imported { entries } => entries,
        };
        fetched.push(vs.clone());

        let mut found: Option<String> = None;
        match entries.first() {
            Some(first) if *first == *version => {
                for candidate in &entries[1..] {
                    let cs = candidate.to_string();
                    if working_set.contains(&cs) {
                        found = Some(cs);
                        break;
                    }
                    if !skip.contains(&cs) {
                        log::warn!("ghost version {} in changelog of {}", candidate, vs);
                    }
                }
            }
            Some(first) => {
                log::warn!("changelog of {} starts with {}; importing it as a root", vs, first)
            }
            None => log::warn!("changelog of {} is unusable; importing it as a root", vs),
        }

        match found {
            Some(ps) => {
                prev.insert(vs.clone(), ps.clone());
                if !in_window.contains(&ps) || resolved.contains_key(&ps) {
                    initial.push(vs);
                } else {
                    successors.entry(ps).or_default().push(vs);
                }
            }
            None => initial.push(vs),
        }
    }

    // Predecessors that turned out to be already imported never pop in
    // the second pass; their successors start chains of their own.
    for version in window.iter().rev() {
        let vs = version.to_string();
        if resolved.contains_key(&vs) {
            if let Some(successors) = successors.remove(&vs) {
                initial.extend(successors);
            }
        }
    }

    let mut order: Vec<String> = vec![];
    let mut done: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = initial.into_iter().collect();
    while let Some(vs) = queue.pop_front() {
        if !done.insert(vs.clone()) {
            return Err(Error::Loop { version: vs });
        }
        if let Some(successors) = successors.remove(&vs) {
            queue.extend(successors);
        }
        order.push(vs);
    }
    // A closed predecessor cycle is unreachable from any root; nothing
    // may be emitted before that is diagnosed.
    for vs in &fetched {
        if !done.contains(vs) {
            return Err(Error::Loop {
                version: vs.clone(),
            });
        }
    }

    let newest = window
        .iter()
        .map(|v| v.to_string())
        .find(|vs| resolved.contains_key(vs) || done.contains(vs));

    Ok(Plan {
        order,
        prev,
        in_window,
        resolved,
        newest,
    })
}

/// Run one complete import: list versions, plan, emit.
pub fn run<W: Write>(ctx: &mut RunContext, out: &mut W) -> Result<(), Error> {
    let package = ctx.package.clone();
    let depth = ctx.depth;
    let skip = ctx.skip.clone();
    let all_versions = ctx.snapshot.list_versions(&package)?;
    let working: Vec<Version> = all_versions
        .into_iter()
        .filter(|v| !skip.contains(&v.to_string()))
        .collect();

    let mut packages: HashMap<String, SourcePackage> = HashMap::new();
    let plan = {
        let packages = &mut packages;
        build_plan(&working, depth, &skip, |version| {
            if let Some(commit) = ctx.git.tag_commit(&tags::quote_tag(version)) {
                return Ok(Probe::AlreadyImported(commit));
            }
            let mut sp = match ctx.snapshot.fetch_srcfiles(&package, version, &ctx.gate) {
                Ok(sp) => sp,
                Err(snapshot::Error::MissingSource { .. })
                | Err(snapshot::Error::NoDsc { .. }) => return Ok(Probe::Missing),
                Err(e) => return Err(e.into()),
            };
            if let Some(note) = &sp.malformed {
                log::warn!("{} {}: {}", package, version, note);
            }
            ctx.unpacker.unpack(&mut sp)?;
            let xdir = sp.xdir.clone().expect("unpack sets xdir");
            let entries = match changelog::read_package_changelog(&xdir) {
                Ok(info) => {
                    sp.attribution = info.attribution;
                    info.versions
                }
                Err(e) => {
                    log::warn!("broken changelog in {} {}: {}", package, version, e);
                    vec![]
                }
            };
            packages.insert(version.to_string(), sp);
            Ok(Probe::Imported { entries })
        })?
    };

    let mut emitter = Emitter::new(out, &ctx.git, ctx.scratch_index(), &ctx.remote, &package);
    emitter.emit(&plan, &packages)?;
    Ok(())
}
