//! Sidebar catalog model and its element actions
//!
//! Sections hold documents. A context menu offers add / rename / remove on a
//! targeted element; which of the three apply depends on the element kind,
//! and [`Catalog::apply`] dispatches on the target tag.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, info};

const SECTION_PREFIX: &str = "Section_";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("no element at {0}")]
    NoSuchTarget(ElementTarget),

    #[error("{element} does not support {action}")]
    Unsupported {
        element: &'static str,
        action: ActionKind,
    },

    #[error("{0:?} is already in this section")]
    DuplicateDocument(PathBuf),

    #[error("name must not be empty")]
    EmptyName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Add,
    Rename,
    Remove,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionKind::Add => "add",
            ActionKind::Rename => "rename",
            ActionKind::Remove => "remove",
        })
    }
}

/// An element the menu was opened on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementTarget {
    Section(usize),
    Document { section: usize, document: usize },
}

impl fmt::Display for ElementTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementTarget::Section(section) => write!(f, "section {section}"),
            ElementTarget::Document { section, document } => {
                write!(f, "document {document} of section {section}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementAction {
    Add(DocumentEntry),
    Rename(String),
    Remove,
}

impl ElementAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            ElementAction::Add(_) => ActionKind::Add,
            ElementAction::Rename(_) => ActionKind::Rename,
            ElementAction::Remove => ActionKind::Remove,
        }
    }
}

/// The three menu capabilities. Kinds opt in by overriding; the defaults
/// refuse.
pub trait Editable {
    const ELEMENT: &'static str;
    const ACTIONS: &'static [ActionKind];

    fn add(&mut self, entry: DocumentEntry) -> Result<(), CatalogError> {
        let _ = entry;
        Err(unsupported::<Self>(ActionKind::Add))
    }

    fn rename(&mut self, name: &str) -> Result<(), CatalogError> {
        let _ = name;
        Err(unsupported::<Self>(ActionKind::Rename))
    }

    /// Releases the element's content ahead of detaching it. Returns the
    /// on-disk paths the caller should delete.
    fn remove(&mut self) -> Result<Vec<PathBuf>, CatalogError> {
        Err(unsupported::<Self>(ActionKind::Remove))
    }
}

fn unsupported<E: Editable + ?Sized>(action: ActionKind) -> CatalogError {
    CatalogError::Unsupported {
        element: E::ELEMENT,
        action,
    }
}

fn checked_name(name: &str) -> Result<String, CatalogError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CatalogError::EmptyName);
    }
    Ok(name.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentEntry {
    pub name: String,
    pub path: PathBuf,
}

impl DocumentEntry {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

impl Editable for DocumentEntry {
    const ELEMENT: &'static str = "document";
    const ACTIONS: &'static [ActionKind] = &[ActionKind::Rename, ActionKind::Remove];

    fn rename(&mut self, name: &str) -> Result<(), CatalogError> {
        self.name = checked_name(name)?;
        Ok(())
    }

    fn remove(&mut self) -> Result<Vec<PathBuf>, CatalogError> {
        Ok(vec![self.path.clone()])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub label: String,
    pub dir: PathBuf,
    pub documents: Vec<DocumentEntry>,
}

impl Section {
    pub fn new(label: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            dir: dir.into(),
            documents: Vec::new(),
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.documents.iter().any(|doc| doc.path == path)
    }
}

impl Editable for Section {
    const ELEMENT: &'static str = "section";
    const ACTIONS: &'static [ActionKind] = &[ActionKind::Add, ActionKind::Rename, ActionKind::Remove];

    fn add(&mut self, entry: DocumentEntry) -> Result<(), CatalogError> {
        if self.contains(&entry.path) {
            return Err(CatalogError::DuplicateDocument(entry.path));
        }
        self.documents.push(entry);
        Ok(())
    }

    fn rename(&mut self, name: &str) -> Result<(), CatalogError> {
        self.label = checked_name(name)?;
        Ok(())
    }

    fn remove(&mut self) -> Result<Vec<PathBuf>, CatalogError> {
        self.documents.clear();
        Ok(vec![self.dir.clone()])
    }
}

fn apply_to<E: Editable>(element: &mut E, action: ElementAction) -> Result<Vec<PathBuf>, CatalogError> {
    match action {
        ElementAction::Add(entry) => element.add(entry).map(|()| Vec::new()),
        ElementAction::Rename(name) => element.rename(&name).map(|()| Vec::new()),
        ElementAction::Remove => element.remove(),
    }
}

/// Lowest `n` such that `Section_n` is not among `labels`.
fn lowest_free_postfix<'a>(labels: impl Iterator<Item = &'a str>) -> usize {
    let taken: BTreeSet<usize> = labels
        .filter_map(|label| label.strip_prefix(SECTION_PREFIX)?.parse().ok())
        .collect();
    (0..).find(|n| !taken.contains(n)).unwrap_or(taken.len())
}

/// All sections, in sidebar order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    root: PathBuf,
    sections: Vec<Section>,
}

impl Catalog {
    /// Empty catalog whose section directories live under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sections: Vec::new(),
        }
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn document(&self, section: usize, document: usize) -> Option<&DocumentEntry> {
        self.sections.get(section)?.documents.get(document)
    }

    /// Label for a new section: `Section_<n>` with the lowest unused `n`.
    pub fn next_section_label(&self) -> String {
        let n = lowest_free_postfix(self.sections.iter().map(|s| s.label.as_str()));
        format!("{SECTION_PREFIX}{n}")
    }

    fn next_section_dir(&self) -> PathBuf {
        let names: Vec<String> = self
            .sections
            .iter()
            .filter_map(|s| s.dir.file_name()?.to_str().map(str::to_string))
            .collect();
        let n = lowest_free_postfix(names.iter().map(String::as_str));
        self.root.join(format!("{SECTION_PREFIX}{n}"))
    }

    /// Appends an empty section with a fresh label and directory. Returns its
    /// index.
    pub fn add_section(&mut self) -> usize {
        let section = Section::new(self.next_section_label(), self.next_section_dir());
        info!("new section {} at {:?}", section.label, section.dir);
        self.sections.push(section);
        self.sections.len() - 1
    }

    /// Menu entries to show for `target`. Empty if the target does not exist.
    pub fn supported_actions(&self, target: ElementTarget) -> &'static [ActionKind] {
        match target {
            ElementTarget::Section(i) if i < self.sections.len() => Section::ACTIONS,
            ElementTarget::Document { section, document }
                if self.document(section, document).is_some() =>
            {
                DocumentEntry::ACTIONS
            }
            _ => &[],
        }
    }

    /// Applies `action` to `target`. A removed element is detached from its
    /// container; the returned paths are the files or directories it owned.
    pub fn apply(
        &mut self,
        target: ElementTarget,
        action: ElementAction,
    ) -> Result<Vec<PathBuf>, CatalogError> {
        debug!("{} on {target}", action.kind());
        let removing = action.kind() == ActionKind::Remove;

        match target {
            ElementTarget::Section(i) => {
                let section = self
                    .sections
                    .get_mut(i)
                    .ok_or(CatalogError::NoSuchTarget(target))?;
                let released = apply_to(section, action)?;
                if removing {
                    self.sections.remove(i);
                }
                Ok(released)
            }
            ElementTarget::Document { section, document } => {
                let documents = &mut self
                    .sections
                    .get_mut(section)
                    .ok_or(CatalogError::NoSuchTarget(target))?
                    .documents;
                let entry = documents
                    .get_mut(document)
                    .ok_or(CatalogError::NoSuchTarget(target))?;
                let released = apply_to(entry, action)?;
                if removing {
                    documents.remove(document);
                }
                Ok(released)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        let mut catalog = Catalog::new("/data");
        let first = catalog.add_section();
        catalog
            .apply(
                ElementTarget::Section(first),
                ElementAction::Add(DocumentEntry::new("Manual", "/data/Section_0/abc")),
            )
            .unwrap();
        catalog.add_section();
        catalog
    }

    #[test]
    fn section_labels_fill_the_lowest_gap() {
        let mut catalog = catalog();
        assert_eq!(catalog.next_section_label(), "Section_2");

        catalog
            .apply(ElementTarget::Section(0), ElementAction::Remove)
            .unwrap();
        assert_eq!(catalog.next_section_label(), "Section_0");

        let index = catalog.add_section();
        assert_eq!(catalog.sections()[index].dir, Path::new("/data/Section_0"));
    }

    #[test]
    fn renamed_sections_do_not_hold_a_postfix() {
        let mut catalog = catalog();
        catalog
            .apply(ElementTarget::Section(0), ElementAction::Rename("Papers".into()))
            .unwrap();

        assert_eq!(catalog.next_section_label(), "Section_0");
    }

    #[test]
    fn menu_offers_per_kind_actions() {
        let catalog = catalog();
        let doc = ElementTarget::Document {
            section: 0,
            document: 0,
        };

        assert_eq!(catalog.supported_actions(ElementTarget::Section(1)).len(), 3);
        assert_eq!(
            catalog.supported_actions(doc),
            &[ActionKind::Rename, ActionKind::Remove]
        );
        assert!(catalog.supported_actions(ElementTarget::Section(9)).is_empty());
    }

    #[test]
    fn documents_cannot_add() {
        let mut catalog = catalog();
        let doc = ElementTarget::Document {
            section: 0,
            document: 0,
        };

        let err = catalog
            .apply(doc, ElementAction::Add(DocumentEntry::new("x", "/x")))
            .unwrap_err();

        assert_eq!(
            err,
            CatalogError::Unsupported {
                element: "document",
                action: ActionKind::Add
            }
        );
    }

    #[test]
    fn duplicate_document_is_rejected() {
        let mut catalog = catalog();

        let err = catalog
            .apply(
                ElementTarget::Section(0),
                ElementAction::Add(DocumentEntry::new("Again", "/data/Section_0/abc")),
            )
            .unwrap_err();

        assert!(matches!(err, CatalogError::DuplicateDocument(_)));
        assert_eq!(catalog.sections()[0].documents.len(), 1);
    }

    #[test]
    fn removing_returns_owned_paths_and_detaches() {
        let mut catalog = catalog();
        let doc = ElementTarget::Document {
            section: 0,
            document: 0,
        };

        let released = catalog.apply(doc, ElementAction::Remove).unwrap();
        assert_eq!(released, vec![PathBuf::from("/data/Section_0/abc")]);
        assert!(catalog.document(0, 0).is_none());

        let released = catalog
            .apply(ElementTarget::Section(1), ElementAction::Remove)
            .unwrap();
        assert_eq!(released, vec![PathBuf::from("/data/Section_1")]);
        assert_eq!(catalog.sections().len(), 1);
    }

    #[test]
    fn blank_rename_and_missing_target_fail() {
        let mut catalog = catalog();

        assert_eq!(
            catalog.apply(ElementTarget::Section(0), ElementAction::Rename("  ".into())),
            Err(CatalogError::EmptyName)
        );
        assert!(matches!(
            catalog.apply(ElementTarget::Section(7), ElementAction::Remove),
            Err(CatalogError::NoSuchTarget(_))
        ));
    }
}
