//! Greedy coloring of elements for race-free parallel assembly.
use std::collections::BTreeSet;

#[derive(Debug)]
struct Color {
    elements: Vec<usize>,
    nodes: BTreeSet<usize>,
}

impl Color {
    fn new_with_element(element: usize, nodes: &[usize]) -> Self {
        Self {
            elements: vec![element],
            nodes: nodes.iter().copied().collect(),
        }
    }

    fn try_add_element(&mut self, element: usize, nodes: &[usize], workspace_set: &mut BTreeSet<usize>) -> bool {
        workspace_set.clear();
        workspace_set.extend(nodes.iter().copied());

        if self.nodes.is_disjoint(workspace_set) {
            self.elements.push(element);
            self.nodes.extend(workspace_set.iter().copied());
            true
        } else {
            false
        }
    }
}

/// Partitions elements into colors such that no two elements of the same color share a node.
///
/// `element_nodes[e]` lists the nodes of element `e`. Each color lists its elements in
/// increasing order, and every element appears in exactly one color.
pub fn sequential_greedy_coloring<N: AsRef<[usize]>>(element_nodes: &[N]) -> Vec<Vec<usize>> {
    let mut colors = Vec::<Color>::new();
    let mut workspace_set = BTreeSet::new();

    'element_loop: for (element, nodes) in element_nodes.iter().enumerate() {
        let nodes = nodes.as_ref();
        for color in &mut colors {
            if color.try_add_element(element, nodes, &mut workspace_set) {
                continue 'element_loop;
            }
        }

        // The element conflicts with every existing color
        colors.push(Color::new_with_element(element, nodes));
    }

    colors.into_iter().map(|color| color.elements).collect()
}
