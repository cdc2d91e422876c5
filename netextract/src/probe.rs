//! Net probing: which net is at this point?

use crate::clusters::{ClusterId, HierClusters};
use crate::core::{ExtractError, LayoutToNetlist};
use crate::geom::Point;
use crate::layout::{CellIndex, LayerIndex, Layout};
use crate::netlist::NetRef;
use crate::store::Region;

struct ProbeHit {
    path: Vec<(CellIndex, usize)>,
    cell: CellIndex,
    local: ClusterId,
}

fn search(
    layout: &Layout,
    clusters: &HierClusters,
    layer: LayerIndex,
    cell: CellIndex,
    p: Point,
    path: &mut Vec<(CellIndex, usize)>,
) -> Option<ProbeHit> {
    let cc = clusters.cell(cell)?;
    if let Some(local) = cc.local().cluster_at(layer, p) {
        return Some(ProbeHit {
            path: path.clone(),
            cell,
            local,
        });
    }
    for (ii, inst) in layout.cell(cell).instances().iter().enumerate() {
        let inside = clusters
            .cell(inst.cell)
            .and_then(|c| c.bbox())
            .is_some_and(|b| b.transformed(&inst.trans).contains(p));
        if !inside {
            continue;
        }
        path.push((cell, ii));
        let hit = search(layout, clusters, layer, inst.cell, inst.trans.inverted().apply(p), path);
        path.pop();
        if hit.is_some() {
            return hit;
        }
    }
    None
}

impl LayoutToNetlist {
    /// The net of `region`'s shapes at `point` (database units, top cell)
    ///
    /// The net returned belongs to the topmost circuit the cluster at that
    /// point is still connected in. `Ok(None)` if nothing is there or the
    /// net has been purged.
    pub fn probe_net(&self, region: &Region, point: Point) -> Result<Option<NetRef>, ExtractError> {
        let clusters = self.net_clusters()?;
        let netlist = self.netlist()?;
        let layer = self.layer_of(region)?;
        let layout = self.internal_layout();

        let mut path = Vec::new();
        let Some(hit) = search(layout, clusters, layer, clusters.top_cell(), point, &mut path)
        else {
            return Ok(None);
        };

        let Some(mut id) = clusters
            .cell(hit.cell)
            .and_then(|c| c.cluster_of_local(hit.local))
        else {
            return Ok(None);
        };
        let mut circuit = hit.cell;
        for &(parent, instance) in hit.path.iter().rev() {
            match clusters
                .cell(parent)
                .and_then(|c| c.cluster_of_instance(instance, id))
            {
                Some(parent_id) => {
                    id = parent_id;
                    circuit = parent;
                }
                None => break,
            }
        }

        let net = NetRef::new(circuit, id);
        Ok(netlist.net(net).map(|_| net))
    }

    /// Like [`LayoutToNetlist::probe_net`] with micrometer coordinates
    pub fn probe_net_um(
        &self,
        region: &Region,
        x: f64,
        y: f64,
    ) -> Result<Option<NetRef>, ExtractError> {
        let dbu = self.internal_layout().dbu();
        let p = Point::new((x / dbu).round() as i64, (y / dbu).round() as i64);
        self.probe_net(region, p)
    }
}
