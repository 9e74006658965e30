//! Reconciliation scenarios: the event labeling produced by backtracing.
//!
//! A scenario assigns every gene node an event (speciation, duplication,
//! transfer, ...) and a hosting species node, realizing one maximum
//! likelihood reconciliation. It also aggregates per-event and per-species
//! counts and renders the two output artifacts: the per-species event
//! table and the event-annotated Newick tree.

use std::collections::HashSet;

use crate::gene_tree::{GeneTree, SubnodeId};
use crate::species_tree::SpeciesTree;
use velella_core::Summarizable;

/// Reconciliation event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventKind {
    /// Speciation.
    S,
    /// Duplication.
    D,
    /// Loss.
    L,
    /// Horizontal transfer.
    T,
    /// Speciation with loss of one descending lineage.
    SL,
    /// Transfer with loss of the source copy.
    TL,
    /// Terminal leaf match (no event).
    None,
}

impl EventKind {
    /// All kinds, in counter order.
    pub const ALL: [EventKind; 7] = [
        EventKind::S,
        EventKind::D,
        EventKind::L,
        EventKind::T,
        EventKind::SL,
        EventKind::TL,
        EventKind::None,
    ];

    fn index(self) -> usize {
        match self {
            EventKind::S => 0,
            EventKind::D => 1,
            EventKind::L => 2,
            EventKind::T => 3,
            EventKind::SL => 4,
            EventKind::TL => 5,
            EventKind::None => 6,
        }
    }

    /// Short name used in output artifacts.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::S => "S",
            EventKind::D => "D",
            EventKind::L => "L",
            EventKind::T => "T",
            EventKind::SL => "SL",
            EventKind::TL => "TL",
            EventKind::None => "None",
        }
    }
}

/// One reconciliation event.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Event {
    /// Event kind.
    pub kind: EventKind,
    /// CLV row of the gene node (virtual row for the root event).
    pub gene: usize,
    /// Hosting species node.
    pub species: usize,
    /// Destination species (transfers only).
    pub dest: Option<usize>,
}

/// Event counts on one species node.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpeciesEvents {
    /// Gene leaves hosted here.
    pub leaf_count: u32,
    /// Duplications.
    pub d_count: u32,
    /// Speciations.
    pub s_count: u32,
    /// Speciation-loss events.
    pub sl_count: u32,
    /// Transfers originating here.
    pub t_count: u32,
    /// Transfer-loss events originating here.
    pub tl_count: u32,
}

impl SpeciesEvents {
    /// Total number of non-leaf events hosted on this species node.
    pub fn total(&self) -> u32 {
        self.d_count + self.s_count + self.sl_count + self.t_count + self.tl_count
    }
}

/// A full reconciliation of one gene tree against the species tree.
#[derive(Debug)]
pub struct Scenario {
    events: Vec<Event>,
    counts: [u32; 7],
    per_species: Vec<SpeciesEvents>,
    gene_events: Vec<Vec<Event>>,
    root_subnode: Option<SubnodeId>,
    species_root: Option<usize>,
    blacklist: HashSet<(usize, usize)>,
}

impl Scenario {
    /// Empty scenario over `gene_rows` CLV rows and `species_count`
    /// species nodes.
    pub fn new(gene_rows: usize, species_count: usize) -> Self {
        Self {
            events: Vec::new(),
            counts: [0; 7],
            per_species: vec![SpeciesEvents::default(); species_count],
            gene_events: vec![Vec::new(); gene_rows],
            root_subnode: None,
            species_root: None,
            blacklist: HashSet::new(),
        }
    }

    pub(crate) fn set_roots(&mut self, root_subnode: SubnodeId, species_root: usize) {
        self.root_subnode = Some(root_subnode);
        self.species_root = Some(species_root);
    }

    /// Record one event.
    pub fn add_event(&mut self, kind: EventKind, gene: usize, species: usize, dest: Option<usize>) {
        self.counts[kind.index()] += 1;
        let slot = &mut self.per_species[species];
        match kind {
            EventKind::S => slot.s_count += 1,
            EventKind::D => slot.d_count += 1,
            EventKind::SL => slot.sl_count += 1,
            EventKind::T => slot.t_count += 1,
            EventKind::TL => slot.tl_count += 1,
            EventKind::None => slot.leaf_count += 1,
            EventKind::L => {}
        }
        let event = Event {
            kind,
            gene,
            species,
            dest,
        };
        self.gene_events[gene].push(event.clone());
        self.events.push(event);
    }

    /// Number of recorded events of one kind.
    pub fn event_count(&self, kind: EventKind) -> u32 {
        self.counts[kind.index()]
    }

    /// All events in backtrace order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Events recorded for one CLV row, in backtrace order.
    pub fn gene_events(&self, gene: usize) -> &[Event] {
        &self.gene_events[gene]
    }

    /// Per-species event counts.
    pub fn per_species(&self) -> &[SpeciesEvents] {
        &self.per_species
    }

    /// The ML gene root chosen by the backtrace, if set.
    pub fn root_subnode(&self) -> Option<SubnodeId> {
        self.root_subnode
    }

    /// The ML species root chosen by the backtrace, if set.
    pub fn species_root(&self) -> Option<usize> {
        self.species_root
    }

    /// Mark a `(gene row, species)` pair as visited; used to break
    /// pathological transfer cycles during backtracing.
    pub fn blacklist_pair(&mut self, gene: usize, species: usize) {
        self.blacklist.insert((gene, species));
    }

    /// True if the pair was blacklisted.
    pub fn is_blacklisted(&self, gene: usize, species: usize) -> bool {
        self.blacklist.contains(&(gene, species))
    }

    /// Per-species counts, one line per species node in post-order:
    /// `label LeafCount DCount SCount SLCount TCount TLCount`.
    pub fn per_species_counts_text(&self, species: &SpeciesTree) -> String {
        let mut out = String::new();
        for &id in species.post_order() {
            let events = &self.per_species[id];
            out.push_str(&format!(
                "{} {} {} {} {} {} {}\n",
                species.node(id).label,
                events.leaf_count,
                events.d_count,
                events.s_count,
                events.sl_count,
                events.t_count,
                events.tl_count,
            ));
        }
        out
    }

    /// The reconciled gene tree in Newick form, each inner node labeled
    /// `species_EVENT` for its final event.
    pub fn annotated_newick(&self, genes: &GeneTree, species: &SpeciesTree) -> String {
        let root = match self.root_subnode {
            Some(root) => root,
            None => return String::new(),
        };
        let mut buf = String::from("(");
        self.write_annotated(genes, species, root, &mut buf);
        buf.push(',');
        self.write_annotated(genes, species, genes.back(root), &mut buf);
        buf.push(')');
        let virtual_row = root + genes.subnode_count();
        buf.push_str(&self.annotation(species, virtual_row));
        buf.push(';');
        buf
    }

    fn write_annotated(
        &self,
        genes: &GeneTree,
        species: &SpeciesTree,
        subnode: SubnodeId,
        buf: &mut String,
    ) {
        if genes.is_leaf(subnode) {
            buf.push_str(genes.subnode(subnode).label.as_deref().unwrap_or(""));
            return;
        }
        let (left, right) = genes.children(subnode, false);
        buf.push('(');
        self.write_annotated(genes, species, left, buf);
        buf.push(',');
        self.write_annotated(genes, species, right, buf);
        buf.push(')');
        buf.push_str(&self.annotation(species, subnode));
    }

    /// Label for the final event of a gene row, empty when the backtrace
    /// never visited it.
    fn annotation(&self, species: &SpeciesTree, gene: usize) -> String {
        match self.gene_events[gene].last() {
            Some(event) => format!(
                "{}_{}",
                species.node(event.species).label,
                event.kind.as_str()
            ),
            None => String::new(),
        }
    }
}

impl Summarizable for Scenario {
    fn summary(&self) -> String {
        format!(
            "Scenario: {} S, {} D, {} T, {} SL, {} TL, {} leaves",
            self.event_count(EventKind::S),
            self.event_count(EventKind::D),
            self.event_count(EventKind::T),
            self.event_count(EventKind::SL),
            self.event_count(EventKind::TL),
            self.event_count(EventKind::None),
        )
    }
}
