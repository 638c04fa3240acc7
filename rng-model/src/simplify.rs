//! The simplification pipeline.
//!
//! Each numbered step is a tree-to-tree rewrite; steps run in order and a
//! caller may stop at any numbered boundary. The numbering follows the
//! RELAX NG simplification rules the steps implement, which is why it is
//! not contiguous.

use crate::datatype::{self, xsd, Param};
use crate::{restrict, CompileConfig, ManifestEntry, Resources, SchemaError, Simplified};
use log::debug;
use rng_syntax::tree::{Child, NodeId, Tree};
use rng_syntax::{depends_on_external_file, parse_into};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;
use url::Url;

const STEPS: [u8; 10] = [1, 4, 6, 9, 10, 14, 15, 16, 17, 18];

pub(crate) fn run<R: Resources>(
    resources: &R,
    config: &CompileConfig,
    url: &Url,
    stop: u8,
) -> Result<Simplified, SchemaError> {
    let mut state = State {
        tree: Tree::new(),
        warnings: Vec::new(),
        manifest: Vec::new(),
        intermediates: Vec::new(),
        resources,
        config,
    };
    let mut root = state.load(url)?;
    for &step in STEPS.iter() {
        if step > stop {
            break;
        }
        let started = Instant::now();
        root = state.apply(step, root)?;
        if config.timing {
            eprintln!("step {}: {}ms", step, started.elapsed().as_millis());
        }
        if config.verbose {
            eprintln!("step {} done", step);
        }
        debug!("simplification step {} complete", step);
        if config.keep_temp {
            let snapshot = state.tree.write_xml(root);
            state.intermediates.push((step, snapshot));
        }
    }
    if stop >= 18 && config.validate {
        restrict::check(&state.tree, root)?;
    }
    Ok(Simplified {
        tree: state.tree,
        root,
        warnings: state.warnings,
        manifest: state.manifest,
        intermediates: state.intermediates,
    })
}

struct State<'a, R: Resources> {
    tree: Tree,
    warnings: Vec<String>,
    manifest: Vec<ManifestEntry>,
    intermediates: Vec<(u8, String)>,
    resources: &'a R,
    config: &'a CompileConfig,
}

impl<'a, R: Resources> State<'a, R> {
    fn apply(&mut self, step: u8, root: NodeId) -> Result<NodeId, SchemaError> {
        match step {
            1 => self.step1_inline(root),
            4 => self.step4_names(root),
            6 => self.step6_datatype_library(root),
            9 => self.step9_scopes(root),
            10 => self.step10_flatten(root),
            14 => self.step14_normalize(root),
            15 => self.step15_not_allowed(root),
            16 => self.step16_empty(root),
            17 => self.step17_choice_order(root),
            18 => self.step18_datatypes(root),
            _ => unreachable!("no step {}", step),
        }
    }

    fn load(&mut self, url: &Url) -> Result<NodeId, SchemaError> {
        let resource = self.resources.load(url)?;
        if self.config.create_manifest {
            self.manifest.push(ManifestEntry {
                file_path: url.to_string(),
                hash: self.config.manifest_hash.digest(&resource),
            });
        }
        Ok(parse_into(&mut self.tree, resource.text(), url.as_str())?)
    }

    fn invalid(&self, node: NodeId, detail: &str) -> SchemaError {
        SchemaError::InvalidSchema {
            path: self.tree.path(node),
            detail: detail.to_string(),
        }
    }

    // --- Step 1: load and inline external references ---

    fn step1_inline(&mut self, root: NodeId) -> Result<NodeId, SchemaError> {
        let mut passes = 0;
        while depends_on_external_file(&self.tree, root) {
            passes += 1;
            if passes > 1000 {
                return Err(SchemaError::IncludeCycle {
                    url: self.tree.base(root).to_string(),
                });
            }
            let mut refs = Vec::new();
            collect_external_refs(&self.tree, root, &mut refs);
            for node in refs {
                if !self.attached_to(node, root) {
                    continue;
                }
                match self.tree.name(node) {
                    "externalRef" => self.inline_external_ref(node)?,
                    "include" => self.inline_include(node)?,
                    _ => unreachable!(),
                }
            }
        }
        Ok(root)
    }

    fn attached_to(&self, mut node: NodeId, root: NodeId) -> bool {
        loop {
            if node == root {
                return true;
            }
            match self.tree.parent(node) {
                Some(parent) => node = parent,
                None => return false,
            }
        }
    }

    fn resolve_href(&self, node: NodeId) -> Result<Url, SchemaError> {
        let href = self
            .tree
            .attr(node, "href")
            .ok_or_else(|| SchemaError::MissingHref {
                path: self.tree.path(node),
            })?;
        let base = self.tree.base(node);
        let base_url = Url::parse(base).map_err(|e| SchemaError::BadUrl {
            url: base.to_string(),
            detail: e.to_string(),
        })?;
        let target = base_url.join(href).map_err(|e| SchemaError::BadUrl {
            url: href.to_string(),
            detail: e.to_string(),
        })?;
        // A file including (or referencing) any file already on its own
        // ancestor chain would never terminate.
        let mut cursor = Some(node);
        while let Some(n) = cursor {
            if **self.tree.base(n) == *target.as_str() {
                return Err(SchemaError::IncludeCycle {
                    url: target.to_string(),
                });
            }
            cursor = self.tree.parent(n);
        }
        Ok(target)
    }

    fn inline_external_ref(&mut self, node: NodeId) -> Result<(), SchemaError> {
        let target = self.resolve_href(node)?;
        let loaded = self.load(&target)?;
        if let Some(ns) = self.tree.attr(node, "ns").map(str::to_string) {
            if self.tree.attr(loaded, "ns").is_none() {
                self.tree.set_attr(loaded, "ns", &ns);
            }
        }
        if self.tree.attr(loaded, "datatypeLibrary").is_none() {
            self.tree.set_attr(loaded, "datatypeLibrary", "");
        }
        self.tree.replace_element(node, loaded);
        Ok(())
    }

    fn inline_include(&mut self, node: NodeId) -> Result<(), SchemaError> {
        let target = self.resolve_href(node)?;
        let loaded = self.load(&target)?;
        if self.tree.name(loaded) != "grammar" {
            return Err(SchemaError::IncludedNotAGrammar {
                url: target.to_string(),
            });
        }
        if self.tree.attr(loaded, "datatypeLibrary").is_none() {
            self.tree.set_attr(loaded, "datatypeLibrary", "");
        }

        // Components named by the include override the target's.
        let mut override_start = false;
        let mut override_defines = Vec::new();
        for child in self.tree.element_children(node) {
            match self.tree.name(child) {
                "start" => override_start = true,
                "define" => {
                    let name = self
                        .tree
                        .attr(child, "name")
                        .ok_or_else(|| self.invalid(child, "define without a name"))?;
                    override_defines.push(name.to_string());
                }
                _ => {}
            }
        }
        if override_start && !self.remove_components(loaded, None) {
            return Err(SchemaError::OverrideMissing {
                path: self.tree.path(node),
                name: None,
            });
        }
        for name in &override_defines {
            if !self.remove_components(loaded, Some(name)) {
                return Err(SchemaError::OverrideMissing {
                    path: self.tree.path(node),
                    name: Some(name.clone()),
                });
            }
        }

        // include → div(grammar-as-div, ...include children)
        self.tree.set_name(loaded, "div");
        self.tree.remove_attr(node, "href");
        self.tree.set_name(node, "div");
        let mut children = vec![Child::Element(loaded)];
        children.extend(self.tree.children(node).to_vec());
        self.tree.set_children(node, children);
        Ok(())
    }

    /// Remove `start` components (`name == None`) or same-named `define`
    /// components from a grammar, descending through `div`. Returns whether
    /// anything was removed.
    fn remove_components(&mut self, grammar: NodeId, name: Option<&str>) -> bool {
        let mut removed = false;
        let mut keep = Vec::new();
        for child in self.tree.children(grammar).to_vec() {
            match &child {
                Child::Element(e) => {
                    let elem_name = self.tree.name(*e);
                    let matches = match name {
                        None => elem_name == "start",
                        Some(n) => elem_name == "define" && self.tree.attr(*e, "name") == Some(n),
                    };
                    if matches {
                        removed = true;
                        continue;
                    }
                    if elem_name == "div" {
                        removed |= self.remove_components(*e, name);
                    }
                    keep.push(child);
                }
                Child::Text(_) => keep.push(child),
            }
        }
        self.tree.set_children(grammar, keep);
        removed
    }

    // --- Step 4: name attributes and ns inheritance ---

    fn step4_names(&mut self, root: NodeId) -> Result<NodeId, SchemaError> {
        self.name_attr_to_child(root)?;
        self.inherit_ns(root, "");
        self.strip_ns(root);
        Ok(root)
    }

    fn name_attr_to_child(&mut self, node: NodeId) -> Result<(), SchemaError> {
        let elem = self.tree.name(node).to_string();
        if matches!(elem.as_str(), "element" | "attribute") {
            if let Some(qname) = self.tree.remove_attr(node, "name") {
                let (prefix, local) = split_qname(&qname).ok_or_else(|| {
                    SchemaError::MalformedQName {
                        path: self.tree.path(node),
                        name: qname.clone(),
                    }
                })?;
                let name_el = self.tree.create_like("name", node);
                self.tree.set_text(name_el, local);
                match prefix {
                    Some(prefix) => {
                        let uri = self
                            .tree
                            .resolve_prefix(node, prefix)
                            .ok_or_else(|| SchemaError::MalformedQName {
                                path: self.tree.path(node),
                                name: qname.clone(),
                            })?
                            .to_string();
                        self.tree.set_attr(name_el, "ns", &uri);
                    }
                    None => {
                        // Unprefixed attribute names live in no namespace
                        // unless the attribute says otherwise; unprefixed
                        // element names pick up the inherited ns.
                        if elem == "attribute" && self.tree.attr(node, "ns").is_none() {
                            self.tree.set_attr(name_el, "ns", "");
                        }
                    }
                }
                self.tree.insert_child(node, 0, Child::Element(name_el));
            }
        }
        for child in self.tree.element_children(node) {
            self.name_attr_to_child(child)?;
        }
        Ok(())
    }

    fn inherit_ns(&mut self, node: NodeId, inherited: &str) {
        let current = self
            .tree
            .attr(node, "ns")
            .map(str::to_string)
            .unwrap_or_else(|| inherited.to_string());
        if matches!(self.tree.name(node), "name" | "nsName" | "value")
            && self.tree.attr(node, "ns").is_none()
        {
            self.tree.set_attr(node, "ns", &current);
        }
        for child in self.tree.element_children(node) {
            self.inherit_ns(child, &current);
        }
    }

    fn strip_ns(&mut self, node: NodeId) {
        if !matches!(self.tree.name(node), "name" | "nsName" | "value") {
            self.tree.remove_attr(node, "ns");
        }
        for child in self.tree.element_children(node) {
            self.strip_ns(child);
        }
    }

    // --- Step 6: datatypeLibrary propagation ---

    fn step6_datatype_library(&mut self, root: NodeId) -> Result<NodeId, SchemaError> {
        self.inherit_datatype_library(root, "");
        Ok(root)
    }

    fn inherit_datatype_library(&mut self, node: NodeId, inherited: &str) {
        let current = self
            .tree
            .attr(node, "datatypeLibrary")
            .map(str::to_string)
            .unwrap_or_else(|| inherited.to_string());
        self.tree.set_attr(node, "datatypeLibrary", &current);
        for child in self.tree.element_children(node) {
            self.inherit_datatype_library(child, &current);
        }
    }

    // --- Step 9: define/ref scoping and combine ---

    fn step9_scopes(&mut self, root: NodeId) -> Result<NodeId, SchemaError> {
        let mut scopes: Vec<HashMap<String, String>> = Vec::new();
        let mut used: std::collections::HashSet<String> = std::collections::HashSet::new();
        self.rename_scopes(root, &mut scopes, &mut used)?;
        Ok(root)
    }

    fn rename_scopes(
        &mut self,
        node: NodeId,
        scopes: &mut Vec<HashMap<String, String>>,
        used: &mut std::collections::HashSet<String>,
    ) -> Result<(), SchemaError> {
        if self.tree.name(node) == "grammar" {
            let mut scope = HashMap::new();
            self.collect_define_names(node, &mut scope, used)?;
            scopes.push(scope);
            for child in self.tree.element_children(node) {
                self.rename_scopes(child, scopes, used)?;
            }
            self.merge_combines(node)?;
            scopes.pop();
            return Ok(());
        }

        match self.tree.name(node) {
            "define" => {
                let name = self
                    .tree
                    .attr(node, "name")
                    .ok_or_else(|| self.invalid(node, "define without a name"))?
                    .to_string();
                let renamed = scopes
                    .last()
                    .and_then(|s| s.get(&name))
                    .cloned()
                    .ok_or_else(|| SchemaError::RefError {
                        path: self.tree.path(node),
                        name: name.clone(),
                    })?;
                self.tree.set_attr(node, "name", &renamed);
            }
            "ref" | "parentRef" => {
                let depth = if self.tree.name(node) == "ref" { 1 } else { 2 };
                let name = self
                    .tree
                    .attr(node, "name")
                    .ok_or_else(|| self.invalid(node, "ref without a name"))?
                    .to_string();
                let scope = if scopes.len() >= depth {
                    &scopes[scopes.len() - depth]
                } else {
                    return Err(SchemaError::RefError {
                        path: self.tree.path(node),
                        name,
                    });
                };
                let renamed = scope.get(&name).cloned().ok_or_else(|| SchemaError::RefError {
                    path: self.tree.path(node),
                    name: name.clone(),
                })?;
                self.tree.set_attr(node, "name", &renamed);
            }
            _ => {}
        }
        for child in self.tree.element_children(node) {
            self.rename_scopes(child, scopes, used)?;
        }
        Ok(())
    }

    /// Gather the define names of one grammar's components. A name keeps
    /// itself when no other grammar has claimed it, so re-simplifying an
    /// already-simplified schema is a no-op; colliding names get a numeric
    /// suffix. Multiple defines of the same name within one grammar share
    /// the replacement; step 9's combine pass merges them.
    fn collect_define_names(
        &mut self,
        component_parent: NodeId,
        scope: &mut HashMap<String, String>,
        used: &mut std::collections::HashSet<String>,
    ) -> Result<(), SchemaError> {
        for child in self.tree.element_children(component_parent) {
            match self.tree.name(child) {
                "define" => {
                    let name = self
                        .tree
                        .attr(child, "name")
                        .ok_or_else(|| self.invalid(child, "define without a name"))?
                        .to_string();
                    if !scope.contains_key(&name) {
                        let mut candidate = name.clone();
                        let mut n = 0u32;
                        while used.contains(&candidate) {
                            n += 1;
                            candidate = format!("{}-{}", name, n);
                        }
                        used.insert(candidate.clone());
                        scope.insert(name.clone(), candidate);
                    }
                }
                "div" => self.collect_define_names(child, scope, used)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn merge_combines(&mut self, grammar: NodeId) -> Result<(), SchemaError> {
        let mut defines: HashMap<String, Vec<NodeId>> = HashMap::new();
        let mut starts: Vec<NodeId> = Vec::new();
        self.collect_components(grammar, &mut defines, &mut starts);

        for (name, nodes) in defines {
            self.merge_group(&nodes, Some(&name))?;
        }
        if !starts.is_empty() {
            self.merge_group(&starts, None)?;
        }
        Ok(())
    }

    fn collect_components(
        &self,
        parent: NodeId,
        defines: &mut HashMap<String, Vec<NodeId>>,
        starts: &mut Vec<NodeId>,
    ) {
        for child in self.tree.element_children(parent) {
            match self.tree.name(child) {
                "define" => {
                    let name = self.tree.attr(child, "name").unwrap_or("").to_string();
                    defines.entry(name).or_default().push(child);
                }
                "start" => starts.push(child),
                "div" => self.collect_components(child, defines, starts),
                _ => {}
            }
        }
    }

    fn merge_group(&mut self, nodes: &[NodeId], name: Option<&str>) -> Result<(), SchemaError> {
        let describe = |s: &Self, node: NodeId| match name {
            Some(n) => (s.tree.path(node), n.to_string()),
            None => (s.tree.path(node), "start".to_string()),
        };
        if nodes.len() == 1 {
            self.tree.remove_attr(nodes[0], "combine");
            return Ok(());
        }
        let mut method: Option<String> = None;
        let mut without_combine = 0usize;
        for &node in nodes {
            match self.tree.attr(node, "combine") {
                Some(combine) => match &method {
                    Some(m) if m != combine => {
                        let (path, name) = describe(self, node);
                        return Err(SchemaError::CombineConflict { path, name });
                    }
                    _ => method = Some(combine.to_string()),
                },
                None => without_combine += 1,
            }
        }
        if without_combine > 1 {
            let (path, name) = describe(self, nodes[1]);
            return Err(SchemaError::DuplicateDefinition { path, name });
        }
        let method = match method {
            Some(m) if m == "choice" || m == "interleave" => m,
            Some(_) => {
                let (path, name) = describe(self, nodes[0]);
                return Err(SchemaError::CombineConflict { path, name });
            }
            None => {
                let (path, name) = describe(self, nodes[1]);
                return Err(SchemaError::DuplicateDefinition { path, name });
            }
        };

        let first = nodes[0];
        let combiner = self.tree.create_like(&method, first);
        for &node in nodes {
            let content = self.component_content(node);
            self.tree.push_child(combiner, Child::Element(content));
        }
        self.tree.set_children(first, vec![Child::Element(combiner)]);
        self.tree.remove_attr(first, "combine");
        for &node in &nodes[1..] {
            self.remove_from_parent(node);
        }
        Ok(())
    }

    /// A component's single content pattern, group-wrapping when the source
    /// put several patterns side by side.
    fn component_content(&mut self, node: NodeId) -> NodeId {
        let kids = self.tree.element_children(node);
        if kids.len() == 1 {
            let only = kids[0];
            self.tree.detach(only);
            only
        } else {
            let group = self.tree.create_like("group", node);
            for kid in kids {
                self.tree.detach(kid);
                self.tree.push_child(group, Child::Element(kid));
            }
            group
        }
    }

    fn remove_from_parent(&mut self, node: NodeId) {
        if let Some(parent) = self.tree.parent(node) {
            let keep: Vec<Child> = self
                .tree
                .children(parent)
                .iter()
                .filter(|c| !matches!(c, Child::Element(e) if *e == node))
                .cloned()
                .collect();
            self.tree.set_children(parent, keep);
            self.tree.detach(node);
        }
    }

    // --- Step 10: grammar flattening ---

    fn step10_flatten(&mut self, mut root: NodeId) -> Result<NodeId, SchemaError> {
        if self.tree.name(root) != "grammar" {
            let grammar = self.tree.create_like("grammar", root);
            let start = self.tree.create_like("start", root);
            self.tree.push_child(start, Child::Element(root));
            self.tree.push_child(grammar, Child::Element(start));
            root = grammar;
        }
        self.inline_divs(root);
        let mut hoisted = Vec::new();
        self.flatten_grammars(root, root, &mut hoisted)?;
        self.parent_ref_to_ref(root);

        let mut start = None;
        let mut defines = Vec::new();
        for child in self.tree.element_children(root) {
            match self.tree.name(child) {
                "start" => start = Some(child),
                "define" => defines.push(child),
                other => {
                    let detail = format!("unexpected {} among grammar components", other);
                    return Err(self.invalid(child, &detail));
                }
            }
        }
        let start = start.ok_or_else(|| SchemaError::MissingStart {
            path: self.tree.path(root),
        })?;
        let mut children = vec![Child::Element(start)];
        children.extend(defines.into_iter().map(Child::Element));
        children.extend(hoisted.into_iter().map(Child::Element));
        self.tree.set_children(root, children);
        Ok(root)
    }

    fn inline_divs(&mut self, node: NodeId) {
        loop {
            let children = self.tree.children(node).to_vec();
            if !children
                .iter()
                .any(|c| matches!(c, Child::Element(e) if self.tree.name(*e) == "div"))
            {
                break;
            }
            let mut out = Vec::new();
            for child in children {
                match child {
                    Child::Element(e) if self.tree.name(e) == "div" => {
                        out.extend(self.tree.children(e).to_vec());
                    }
                    other => out.push(other),
                }
            }
            self.tree.set_children(node, out);
        }
        for child in self.tree.element_children(node) {
            self.inline_divs(child);
        }
    }

    fn flatten_grammars(
        &mut self,
        node: NodeId,
        top: NodeId,
        hoisted: &mut Vec<NodeId>,
    ) -> Result<(), SchemaError> {
        for child in self.tree.element_children(node) {
            if self.tree.name(child) == "grammar" && child != top {
                self.flatten_grammars(child, top, hoisted)?;
                let mut start_pattern = None;
                for component in self.tree.element_children(child) {
                    match self.tree.name(component) {
                        "start" => {
                            start_pattern =
                                self.tree.element_children(component).first().copied();
                        }
                        "define" => {
                            self.remove_from_parent(component);
                            hoisted.push(component);
                        }
                        other => {
                            let detail =
                                format!("unexpected {} among grammar components", other);
                            return Err(self.invalid(component, &detail));
                        }
                    }
                }
                let pattern = start_pattern.ok_or_else(|| SchemaError::MissingStart {
                    path: self.tree.path(child),
                })?;
                self.tree.detach(pattern);
                self.tree.replace_element(child, pattern);
            } else {
                self.flatten_grammars(child, top, hoisted)?;
            }
        }
        Ok(())
    }

    fn parent_ref_to_ref(&mut self, node: NodeId) {
        if self.tree.name(node) == "parentRef" {
            self.tree.set_name(node, "ref");
        }
        for child in self.tree.element_children(node) {
            self.parent_ref_to_ref(child);
        }
    }

    // --- Step 14: shorthand elimination and binarization ---

    fn step14_normalize(&mut self, root: NodeId) -> Result<NodeId, SchemaError> {
        self.normalize(root)?;
        Ok(root)
    }

    fn normalize(&mut self, node: NodeId) -> Result<(), SchemaError> {
        for child in self.tree.element_children(node) {
            self.normalize(child)?;
        }
        let name = self.tree.name(node).to_string();
        match name.as_str() {
            "element" => {
                let kids = self.tree.element_children(node);
                if kids.len() < 2 {
                    return Err(self.invalid(node, "element needs a name class and content"));
                }
                if kids.len() > 2 {
                    self.wrap_tail(node, 1, "group");
                }
            }
            "attribute" => {
                let kids = self.tree.element_children(node);
                if kids.is_empty() {
                    return Err(self.invalid(node, "attribute needs a name class"));
                }
                if kids.len() == 1 {
                    let text = self.tree.create_like("text", node);
                    self.tree.push_child(node, Child::Element(text));
                }
                if self.tree.element_children(node).len() > 2 {
                    self.wrap_tail(node, 1, "group");
                }
            }
            "choice" | "group" | "interleave" => self.binarize(node, &name)?,
            "mixed" => {
                self.collapse_to_one(node, "group")?;
                self.tree.set_name(node, "interleave");
                let text = self.tree.create_like("text", node);
                self.tree.push_child(node, Child::Element(text));
            }
            "optional" => {
                self.collapse_to_one(node, "group")?;
                self.tree.set_name(node, "choice");
                let empty = self.tree.create_like("empty", node);
                self.tree.push_child(node, Child::Element(empty));
            }
            "zeroOrMore" => {
                self.collapse_to_one(node, "group")?;
                let kid = self.tree.element_children(node)[0];
                let one = self.tree.create_like("oneOrMore", node);
                self.tree.detach(kid);
                self.tree.push_child(one, Child::Element(kid));
                let empty = self.tree.create_like("empty", node);
                self.tree.set_name(node, "choice");
                self.tree
                    .set_children(node, vec![Child::Element(one), Child::Element(empty)]);
            }
            "oneOrMore" | "list" => self.collapse_to_one(node, "group")?,
            "define" | "start" => {
                if self.tree.element_children(node).len() > 1 {
                    self.wrap_tail(node, 0, "group");
                }
            }
            "except" => {
                if self.tree.element_children(node).len() > 1 {
                    self.wrap_tail(node, 0, "choice");
                }
            }
            "value" => {
                if self.tree.attr(node, "type").is_none() {
                    self.tree.set_attr(node, "type", "token");
                    self.tree.set_attr(node, "datatypeLibrary", "");
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Move the element children from index `keep` onwards under a new
    /// wrapper element.
    fn wrap_tail(&mut self, node: NodeId, keep: usize, kind: &str) {
        let kids = self.tree.element_children(node);
        let wrapper = self.tree.create_like(kind, node);
        for &kid in &kids[keep..] {
            self.tree.detach(kid);
            self.tree.push_child(wrapper, Child::Element(kid));
        }
        let mut children: Vec<Child> = kids[..keep].iter().map(|&k| Child::Element(k)).collect();
        children.push(Child::Element(wrapper));
        self.tree.set_children(node, children);
    }

    fn collapse_to_one(&mut self, node: NodeId, kind: &str) -> Result<(), SchemaError> {
        let kids = self.tree.element_children(node);
        if kids.is_empty() {
            return Err(self.invalid(node, "missing content pattern"));
        }
        if kids.len() > 1 {
            self.wrap_tail(node, 0, kind);
        }
        Ok(())
    }

    /// Right-fold an n-ary combinator to strictly binary form; a singleton
    /// collapses to its only child.
    fn binarize(&mut self, node: NodeId, kind: &str) -> Result<(), SchemaError> {
        let mut kids = self.tree.element_children(node);
        match kids.len() {
            0 => Err(self.invalid(node, "combinator with no children")),
            1 => {
                let only = kids[0];
                self.tree.detach(only);
                self.tree.replace_element(node, only);
                Ok(())
            }
            2 => Ok(()),
            _ => {
                while kids.len() > 2 {
                    let b = kids.pop().unwrap();
                    let a = kids.pop().unwrap();
                    let inner = self.tree.create_like(kind, node);
                    self.tree.detach(a);
                    self.tree.detach(b);
                    self.tree.push_child(inner, Child::Element(a));
                    self.tree.push_child(inner, Child::Element(b));
                    kids.push(inner);
                }
                let children = kids.into_iter().map(Child::Element).collect();
                self.tree.set_children(node, children);
                Ok(())
            }
        }
    }

    // --- Step 15: notAllowed propagation ---

    fn step15_not_allowed(&mut self, root: NodeId) -> Result<NodeId, SchemaError> {
        self.propagate_not_allowed(root);
        Ok(root)
    }

    fn is_named(&self, node: NodeId, name: &str) -> bool {
        self.tree.name(node) == name
    }

    fn propagate_not_allowed(&mut self, node: NodeId) {
        for child in self.tree.element_children(node) {
            self.propagate_not_allowed(child);
        }
        match self.tree.name(node) {
            "attribute" | "list" | "oneOrMore" => {
                let kids = self.tree.element_children(node);
                if let Some(&pattern) = kids.last() {
                    if self.is_named(pattern, "notAllowed") {
                        self.become_not_allowed(node);
                    }
                }
            }
            "group" | "interleave" => {
                let kids = self.tree.element_children(node);
                if kids.iter().any(|&k| self.is_named(k, "notAllowed")) {
                    self.become_not_allowed(node);
                }
            }
            "choice" => {
                let kids = self.tree.element_children(node);
                if kids.len() == 2 {
                    match (
                        self.is_named(kids[0], "notAllowed"),
                        self.is_named(kids[1], "notAllowed"),
                    ) {
                        (true, true) => self.become_not_allowed(node),
                        (true, false) => {
                            let keep = kids[1];
                            self.tree.detach(keep);
                            self.tree.replace_element(node, keep);
                        }
                        (false, true) => {
                            let keep = kids[0];
                            self.tree.detach(keep);
                            self.tree.replace_element(node, keep);
                        }
                        (false, false) => {}
                    }
                }
            }
            "data" => {
                let excepts: Vec<NodeId> = self
                    .tree
                    .element_children(node)
                    .into_iter()
                    .filter(|&c| self.is_named(c, "except"))
                    .collect();
                for except in excepts {
                    let inner = self.tree.element_children(except);
                    if inner.first().map(|&i| self.is_named(i, "notAllowed")).unwrap_or(false) {
                        self.remove_from_parent(except);
                    }
                }
            }
            _ => {}
        }
    }

    fn become_not_allowed(&mut self, node: NodeId) {
        let attr_names: Vec<String> = self
            .tree
            .attrs(node)
            .iter()
            .map(|(n, _)| n.clone())
            .collect();
        for name in attr_names {
            self.tree.remove_attr(node, &name);
        }
        self.tree.set_children(node, Vec::new());
        self.tree.set_name(node, "notAllowed");
    }

    // --- Step 16: empty propagation ---

    fn step16_empty(&mut self, root: NodeId) -> Result<NodeId, SchemaError> {
        self.propagate_empty(root);
        Ok(root)
    }

    fn propagate_empty(&mut self, node: NodeId) {
        for child in self.tree.element_children(node) {
            self.propagate_empty(child);
        }
        match self.tree.name(node) {
            "group" | "interleave" => {
                let kids = self.tree.element_children(node);
                if kids.len() == 2 {
                    let keep = match (
                        self.is_named(kids[0], "empty"),
                        self.is_named(kids[1], "empty"),
                    ) {
                        (true, true) => Some(kids[0]),
                        (true, false) => Some(kids[1]),
                        (false, true) => Some(kids[0]),
                        (false, false) => None,
                    };
                    if let Some(keep) = keep {
                        self.tree.detach(keep);
                        self.tree.replace_element(node, keep);
                    }
                }
            }
            "oneOrMore" => {
                let kids = self.tree.element_children(node);
                if kids.len() == 1 && self.is_named(kids[0], "empty") {
                    let keep = kids[0];
                    self.tree.detach(keep);
                    self.tree.replace_element(node, keep);
                }
            }
            "choice" => {
                let kids = self.tree.element_children(node);
                if kids.len() == 2
                    && self.is_named(kids[0], "empty")
                    && self.is_named(kids[1], "empty")
                {
                    let keep = kids[0];
                    self.tree.detach(keep);
                    self.tree.replace_element(node, keep);
                }
            }
            _ => {}
        }
    }

    // --- Step 17: canonical choice ordering ---

    fn step17_choice_order(&mut self, root: NodeId) -> Result<NodeId, SchemaError> {
        self.order_choices(root);
        Ok(root)
    }

    fn order_choices(&mut self, node: NodeId) {
        for child in self.tree.element_children(node) {
            self.order_choices(child);
        }
        if self.tree.name(node) == "choice" {
            let kids = self.tree.element_children(node);
            if kids.len() == 2
                && self.is_named(kids[1], "empty")
                && !self.is_named(kids[0], "empty")
            {
                self.tree.set_children(
                    node,
                    vec![Child::Element(kids[1]), Child::Element(kids[0])],
                );
            }
        }
    }

    // --- Step 18: datatype pre-flight ---

    fn step18_datatypes(&mut self, root: NodeId) -> Result<NodeId, SchemaError> {
        self.check_datatypes(root)?;
        Ok(root)
    }

    fn check_datatypes(&mut self, node: NodeId) -> Result<(), SchemaError> {
        match self.tree.name(node) {
            "data" => {
                let path = self.tree.path(node);
                let library = self
                    .tree
                    .attr(node, "datatypeLibrary")
                    .unwrap_or("")
                    .to_string();
                let type_name = self
                    .tree
                    .attr(node, "type")
                    .ok_or_else(|| self.invalid(node, "data without a type"))?
                    .to_string();
                let mut params = Vec::new();
                for child in self.tree.element_children(node) {
                    if self.tree.name(child) == "param" {
                        let name = self
                            .tree
                            .attr(child, "name")
                            .ok_or_else(|| self.invalid(child, "param without a name"))?
                            .to_string();
                        params.push(Param {
                            name,
                            value: self.tree.text_content(child),
                        });
                    }
                }
                datatype::compile_datatype(&path, &library, &type_name, &params)?;
                self.warn_entity(&library, &type_name, &path);
            }
            "value" => {
                let path = self.tree.path(node);
                let library = self
                    .tree
                    .attr(node, "datatypeLibrary")
                    .unwrap_or("")
                    .to_string();
                let type_name = self.tree.attr(node, "type").unwrap_or("token").to_string();
                let text = self.tree.text_content(node);
                let bindings = Rc::clone(self.tree.ns_bindings(node));
                if datatype::needs_context(&library, &type_name) {
                    // Rewrite the lexical QName so the compiled pattern is
                    // context-free: ns carries the URI, the body the local
                    // name. A prefix resolves through the element's
                    // namespace snapshot; an unprefixed name keeps the ns
                    // attribute it already has.
                    let lexical = text.trim();
                    match lexical.find(':') {
                        Some(pos) => {
                            let prefix = &lexical[..pos];
                            let local = &lexical[pos + 1..];
                            let malformed = || SchemaError::MalformedQName {
                                path: path.clone(),
                                name: text.clone(),
                            };
                            if local.contains(':')
                                || local.is_empty()
                                || !xsd::is_valid_ncname(prefix)
                            {
                                return Err(malformed());
                            }
                            let uri = bindings
                                .resolve(prefix)
                                .ok_or_else(malformed)?
                                .to_string();
                            let local = local.to_string();
                            self.tree.set_attr(node, "ns", &uri);
                            self.tree.set_text(node, &local);
                        }
                        None => {
                            if !xsd::is_valid_ncname(lexical) {
                                return Err(SchemaError::MalformedQName {
                                    path: path.clone(),
                                    name: text.clone(),
                                });
                            }
                            let local = lexical.to_string();
                            self.tree.set_text(node, &local);
                        }
                    }
                } else {
                    datatype::compile_value(&path, &library, &type_name, &text, &*bindings)?;
                }
                self.warn_entity(&library, &type_name, &path);
            }
            _ => {}
        }
        for child in self.tree.element_children(node) {
            self.check_datatypes(child)?;
        }
        Ok(())
    }

    fn warn_entity(&mut self, library: &str, type_name: &str, path: &str) {
        if library == xsd::NAMESPACE_URI && matches!(type_name, "ENTITY" | "ENTITIES") {
            self.warnings.push(format!(
                "{} at {} is matched lexically; DTD entity declarations are not consulted",
                type_name, path
            ));
        }
    }
}

fn collect_external_refs(tree: &Tree, node: NodeId, out: &mut Vec<NodeId>) {
    if matches!(tree.name(node), "include" | "externalRef") {
        out.push(node);
        // references inside the loaded replacement are found on the next pass
        return;
    }
    for child in tree.element_children(node) {
        collect_external_refs(tree, child, out);
    }
}

fn split_qname(qname: &str) -> Option<(Option<&str>, &str)> {
    let mut parts = qname.splitn(3, ':');
    let first = parts.next()?;
    match (parts.next(), parts.next()) {
        (None, _) => Some((None, first)),
        (Some(local), None) => {
            if first.is_empty() || local.is_empty() {
                None
            } else {
                Some((Some(first), local))
            }
        }
        (Some(_), Some(_)) => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{CompileConfig, Compiler, Resource, Resources};
    use std::collections::HashMap as Map;

    pub(crate) struct MapResources(pub Map<String, String>);

    impl Resources for MapResources {
        fn load(&self, url: &Url) -> Result<Resource, SchemaError> {
            let text = self
                .0
                .get(url.as_str())
                .ok_or_else(|| SchemaError::ResourceLoad {
                    url: url.to_string(),
                    detail: "no such entry".to_string(),
                })?;
            Ok(Resource::new(url.clone(), text.clone()))
        }
    }

    const NS: &str = "http://relaxng.org/ns/structure/1.0";

    fn single(schema: &str) -> MapResources {
        let mut map = Map::new();
        map.insert("file:///main.rng".to_string(), schema.to_string());
        MapResources(map)
    }

    fn simplify_to(schema: &str, to: u8) -> Simplified {
        let resources = single(schema);
        let config = CompileConfig {
            simplify_to: to,
            ..CompileConfig::default()
        };
        let compiler = Compiler::with_config(resources, config);
        let url = Url::parse("file:///main.rng").unwrap();
        compiler.simplify(&url).expect("simplification failed")
    }

    fn first_named(tree: &Tree, node: NodeId, name: &str) -> Option<NodeId> {
        if tree.name(node) == name {
            return Some(node);
        }
        for child in tree.element_children(node) {
            if let Some(found) = first_named(tree, child, name) {
                return Some(found);
            }
        }
        None
    }

    #[test]
    fn name_attribute_becomes_name_child() {
        let out = simplify_to(
            &format!(
                r#"<element name="doc" xmlns="{}" ns="urn:d"><empty/></element>"#,
                NS
            ),
            4,
        );
        let element = first_named(&out.tree, out.root, "element").unwrap();
        let name = out.tree.element_children(element)[0];
        assert_eq!(out.tree.name(name), "name");
        assert_eq!(out.tree.text_content(name), "doc");
        assert_eq!(out.tree.attr(name, "ns"), Some("urn:d"));
    }

    #[test]
    fn unprefixed_attribute_names_have_no_namespace() {
        let out = simplify_to(
            &format!(
                r#"<element name="doc" ns="urn:d" xmlns="{}">
                     <attribute name="x"><text/></attribute>
                   </element>"#,
                NS
            ),
            4,
        );
        let attribute = first_named(&out.tree, out.root, "attribute").unwrap();
        let name = out.tree.element_children(attribute)[0];
        assert_eq!(out.tree.attr(name, "ns"), Some(""));
    }

    #[test]
    fn prefixed_names_resolve_through_the_snapshot() {
        let out = simplify_to(
            &format!(
                r#"<element name="p:doc" xmlns="{}" xmlns:p="urn:p"><empty/></element>"#,
                NS
            ),
            4,
        );
        let name = first_named(&out.tree, out.root, "name").unwrap();
        assert_eq!(out.tree.attr(name, "ns"), Some("urn:p"));
    }

    #[test]
    fn datatype_library_is_propagated() {
        let out = simplify_to(
            &format!(
                r#"<element name="a" xmlns="{}"
                        datatypeLibrary="http://www.w3.org/2001/XMLSchema-datatypes">
                     <data type="int"/>
                   </element>"#,
                NS
            ),
            6,
        );
        let data = first_named(&out.tree, out.root, "data").unwrap();
        assert_eq!(
            out.tree.attr(data, "datatypeLibrary"),
            Some("http://www.w3.org/2001/XMLSchema-datatypes")
        );
    }

    #[test]
    fn colliding_defines_in_nested_grammars_are_renamed_apart() {
        let out = simplify_to(
            &format!(
                r#"<grammar xmlns="{}">
                     <start><ref name="a"/></start>
                     <define name="a">
                       <element name="outer">
                         <grammar>
                           <start><ref name="a"/></start>
                           <define name="a"><element name="inner"><empty/></element></define>
                         </grammar>
                       </element>
                     </define>
                   </grammar>"#,
                NS
            ),
            10,
        );
        let defines: Vec<NodeId> = out
            .tree
            .element_children(out.root)
            .into_iter()
            .filter(|&c| out.tree.name(c) == "define")
            .collect();
        assert_eq!(defines.len(), 2);
        let names: Vec<&str> = defines
            .iter()
            .map(|&d| out.tree.attr(d, "name").unwrap())
            .collect();
        assert_ne!(names[0], names[1]);
        // every ref points at a define that exists
        let mut refs = Vec::new();
        collect_refs(&out.tree, out.root, &mut refs);
        for r in refs {
            assert!(names.contains(&out.tree.attr(r, "name").unwrap()));
        }
    }

    fn collect_refs(tree: &Tree, node: NodeId, out: &mut Vec<NodeId>) {
        if tree.name(node) == "ref" {
            out.push(node);
        }
        for child in tree.element_children(node) {
            collect_refs(tree, child, out);
        }
    }

    #[test]
    fn combine_choice_merges_defines() {
        let out = simplify_to(
            &format!(
                r#"<grammar xmlns="{}">
                     <start><ref name="a"/></start>
                     <define name="a" combine="choice"><element name="x"><empty/></element></define>
                     <define name="a" combine="choice"><element name="y"><empty/></element></define>
                   </grammar>"#,
                NS
            ),
            10,
        );
        let defines: Vec<NodeId> = out
            .tree
            .element_children(out.root)
            .into_iter()
            .filter(|&c| out.tree.name(c) == "define")
            .collect();
        assert_eq!(defines.len(), 1);
        let body = out.tree.element_children(defines[0]);
        assert_eq!(out.tree.name(body[0]), "choice");
        assert_eq!(out.tree.element_children(body[0]).len(), 2);
    }

    #[test]
    fn missing_ref_is_an_error() {
        let resources = single(&format!(
            r#"<grammar xmlns="{}"><start><ref name="nope"/></start></grammar>"#,
            NS
        ));
        let compiler = Compiler::new(resources);
        let url = Url::parse("file:///main.rng").unwrap();
        assert!(matches!(
            compiler.simplify(&url),
            Err(SchemaError::RefError { .. })
        ));
    }

    #[test]
    fn pattern_root_is_wrapped_in_a_grammar() {
        let out = simplify_to(
            &format!(r#"<element name="a" xmlns="{}"><empty/></element>"#, NS),
            10,
        );
        assert_eq!(out.tree.name(out.root), "grammar");
        let start = out.tree.element_children(out.root)[0];
        assert_eq!(out.tree.name(start), "start");
    }

    #[test]
    fn nary_choice_right_folds() {
        let out = simplify_to(
            &format!(
                r#"<element name="a" xmlns="{}">
                     <choice><empty/><text/><notAllowed/><empty/></choice>
                   </element>"#,
                NS
            ),
            14,
        );
        let choice = first_named(&out.tree, out.root, "choice").unwrap();
        let kids = out.tree.element_children(choice);
        assert_eq!(kids.len(), 2);
        assert_eq!(out.tree.name(kids[0]), "empty");
        assert_eq!(out.tree.name(kids[1]), "choice");
        let inner = out.tree.element_children(kids[1]);
        assert_eq!(out.tree.name(inner[0]), "text");
        assert_eq!(out.tree.name(inner[1]), "choice");
    }

    #[test]
    fn zero_or_more_is_rewritten() {
        let out = simplify_to(
            &format!(
                r#"<element name="a" xmlns="{}">
                     <zeroOrMore><element name="b"><empty/></element></zeroOrMore>
                   </element>"#,
                NS
            ),
            14,
        );
        let choice = first_named(&out.tree, out.root, "choice").unwrap();
        let kids = out.tree.element_children(choice);
        assert_eq!(out.tree.name(kids[0]), "oneOrMore");
        assert_eq!(out.tree.name(kids[1]), "empty");
    }

    #[test]
    fn not_allowed_erases_a_group() {
        let out = simplify_to(
            &format!(
                r#"<element name="a" xmlns="{}">
                     <choice>
                       <group><notAllowed/><text/></group>
                       <empty/>
                     </choice>
                   </element>"#,
                NS
            ),
            16,
        );
        // choice(group(notAllowed, text), empty) → choice(notAllowed, empty) → empty
        let element = first_named(&out.tree, out.root, "element").unwrap();
        let content = out.tree.element_children(element)[1];
        assert_eq!(out.tree.name(content), "empty");
    }

    #[test]
    fn choice_puts_empty_first() {
        let out = simplify_to(
            &format!(
                r#"<element name="a" xmlns="{}">
                     <choice><text/><empty/></choice>
                   </element>"#,
                NS
            ),
            17,
        );
        let choice = first_named(&out.tree, out.root, "choice").unwrap();
        let kids = out.tree.element_children(choice);
        assert_eq!(out.tree.name(kids[0]), "empty");
        assert_eq!(out.tree.name(kids[1]), "text");
    }

    #[test]
    fn qname_values_are_rewritten() {
        let out = simplify_to(
            &format!(
                r#"<element name="a" xmlns="{}" xmlns:foo="urn:x"
                        datatypeLibrary="http://www.w3.org/2001/XMLSchema-datatypes">
                     <value type="QName">foo:bar</value>
                   </element>"#,
                NS
            ),
            18,
        );
        let value = first_named(&out.tree, out.root, "value").unwrap();
        assert_eq!(out.tree.attr(value, "ns"), Some("urn:x"));
        assert_eq!(out.tree.text_content(value), "bar");
    }

    #[test]
    fn entity_datatypes_warn_but_do_not_fail() {
        let out = simplify_to(
            &format!(
                r#"<element name="a" xmlns="{}"
                        datatypeLibrary="http://www.w3.org/2001/XMLSchema-datatypes">
                     <data type="ENTITY"/>
                   </element>"#,
                NS
            ),
            18,
        );
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("ENTITY"));
    }

    #[test]
    fn external_ref_is_inlined_and_manifested() {
        let mut map = Map::new();
        map.insert(
            "file:///dir/main.rng".to_string(),
            format!(
                r#"<element name="a" xmlns="{}"><externalRef href="sub/other.rng"/></element>"#,
                NS
            ),
        );
        map.insert(
            "file:///dir/sub/other.rng".to_string(),
            format!(r#"<text xmlns="{}"/>"#, NS),
        );
        let config = CompileConfig {
            create_manifest: true,
            ..CompileConfig::default()
        };
        let compiler = Compiler::with_config(MapResources(map), config);
        let url = Url::parse("file:///dir/main.rng").unwrap();
        let out = compiler.simplify(&url).expect("simplify");
        assert!(first_named(&out.tree, out.root, "externalRef").is_none());
        assert!(first_named(&out.tree, out.root, "text").is_some());
        let files: Vec<&str> = out.manifest.iter().map(|m| &m.file_path[..]).collect();
        assert_eq!(
            files,
            vec!["file:///dir/main.rng", "file:///dir/sub/other.rng"]
        );
        assert!(out.manifest[0].hash.starts_with("SHA-256-"));
    }

    #[test]
    fn include_overrides_a_define() {
        let mut map = Map::new();
        map.insert(
            "file:///main.rng".to_string(),
            format!(
                r#"<grammar xmlns="{}">
                     <start><ref name="root"/></start>
                     <include href="lib.rng">
                       <define name="leaf"><element name="replacement"><empty/></element></define>
                     </include>
                   </grammar>"#,
                NS
            ),
        );
        map.insert(
            "file:///lib.rng".to_string(),
            format!(
                r#"<grammar xmlns="{}">
                     <define name="root"><element name="root"><ref name="leaf"/></element></define>
                     <define name="leaf"><element name="original"><empty/></element></define>
                   </grammar>"#,
                NS
            ),
        );
        let compiler = Compiler::new(MapResources(map));
        let url = Url::parse("file:///main.rng").unwrap();
        let out = compiler.simplify(&url).expect("simplify");
        let mut names = Vec::new();
        collect_element_names(&out.tree, out.root, &mut names);
        assert!(names.contains(&"replacement".to_string()));
        assert!(!names.contains(&"original".to_string()));
    }

    #[test]
    fn include_cycles_are_detected() {
        let mut map = Map::new();
        map.insert(
            "file:///a.rng".to_string(),
            format!(
                r#"<grammar xmlns="{}"><start><ref name="x"/></start><include href="b.rng"/></grammar>"#,
                NS
            ),
        );
        map.insert(
            "file:///b.rng".to_string(),
            format!(
                r#"<grammar xmlns="{}"><include href="a.rng"/></grammar>"#,
                NS
            ),
        );
        let compiler = Compiler::new(MapResources(map));
        let url = Url::parse("file:///a.rng").unwrap();
        assert!(matches!(
            compiler.simplify(&url),
            Err(SchemaError::IncludeCycle { .. })
        ));
    }

    #[test]
    fn simplification_is_idempotent() {
        let schema = format!(
            r#"<grammar xmlns="{}">
                 <start><ref name="doc"/></start>
                 <define name="doc">
                   <element name="doc">
                     <optional><attribute name="id"/></optional>
                     <zeroOrMore><choice><text/><element name="b"><empty/></element></choice></zeroOrMore>
                   </element>
                 </define>
               </grammar>"#,
            NS
        );
        let first = simplify_to(&schema, 18);
        let serialized = first.tree.write_xml(first.root);
        let second = simplify_to(&serialized, 18);
        assert_eq!(serialized, second.tree.write_xml(second.root));
    }

    fn collect_element_names(tree: &Tree, node: NodeId, out: &mut Vec<String>) {
        if tree.name(node) == "name" {
            out.push(tree.text_content(node));
        }
        for child in tree.element_children(node) {
            collect_element_names(tree, child, out);
        }
    }
}
