/**
 * NODE REGISTRY - Catalogue des nœuds WIS2 surveillés
 *
 * RÔLE : métadonnées statiques chargées une fois au démarrage, en lecture seule
 * ensuite (partageable sans synchronisation derrière un Arc).
 */

use crate::models::{Node, NodeId};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct NodeRegistry {
    by_id: HashMap<NodeId, Arc<Node>>,
    /// Ordre d'affichage : pays puis nom
    ordered: Vec<Arc<Node>>,
}

impl NodeRegistry {
    /// Les ids doivent être uniques (validé au chargement de la config) ;
    /// en cas de doublon la dernière entrée gagne.
    pub fn new(nodes: Vec<Node>) -> Self {
        let mut by_id = HashMap::with_capacity(nodes.len());
        for node in nodes {
            by_id.insert(node.id, Arc::new(node));
        }
        let mut ordered: Vec<Arc<Node>> = by_id.values().cloned().collect();
        ordered.sort_by(|a, b| {
            a.country
                .cmp(&b.country)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.id.cmp(&b.id))
        });
        Self { by_id, ordered }
    }

    pub fn list_nodes(&self) -> Vec<Arc<Node>> {
        self.ordered.clone()
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<Node>> {
        self.by_id.get(&id).cloned()
    }

    /// Nœuds marqués actifs, à démarrer au boot
    pub fn active_nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.ordered.iter().filter(|n| n.active)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }
}
