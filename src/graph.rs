//! Operation graph assembly.
//!
//! An [`OperationGraph`] binds one or more [`OperationNode`]s to the device
//! execution context they will run under. Convolution only ever builds
//! single-node graphs, but assembly itself accepts fused chains.

use crate::descriptor::OperationNode;
use crate::error::GraphAssemblyError;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Assembled operations plus the shared context they execute in.
#[derive(Debug)]
pub struct OperationGraph<C> {
    context: Arc<C>,
    operations: Vec<OperationNode>,
}

impl<C> OperationGraph<C> {
    pub fn builder() -> OperationGraphBuilder<C> {
        OperationGraphBuilder { context: None, operations: Vec::new() }
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn operations(&self) -> &[OperationNode] {
        &self.operations
    }

    /// The first (for convolution, the only) node.
    pub fn root(&self) -> &OperationNode {
        // non-empty by construction
        &self.operations[0]
    }
}

/// Builder for [`OperationGraph`].
#[derive(Debug)]
pub struct OperationGraphBuilder<C> {
    context: Option<Arc<C>>,
    operations: Vec<OperationNode>,
}

impl<C> OperationGraphBuilder<C> {
    #[must_use]
    pub fn context(mut self, context: Arc<C>) -> Self {
        self.context = Some(context);
        self
    }

    #[must_use]
    pub fn operation(mut self, node: OperationNode) -> Self {
        self.operations.push(node);
        self
    }

    #[must_use]
    pub fn operations(mut self, nodes: impl IntoIterator<Item = OperationNode>) -> Self {
        self.operations.extend(nodes);
        self
    }

    /// Validates every node and produces the graph.
    pub fn build(self) -> Result<OperationGraph<C>, GraphAssemblyError> {
        let context = self.context.ok_or(GraphAssemblyError::MissingContext)?;
        if self.operations.is_empty() {
            return Err(GraphAssemblyError::NoOperations);
        }
        for node in &self.operations {
            check_node(node)?;
        }
        Ok(OperationGraph { context, operations: self.operations })
    }
}

fn check_node(node: &OperationNode) -> Result<(), GraphAssemblyError> {
    let mut seen = BTreeSet::new();
    for operand in node.operands() {
        if !seen.insert(operand.uid) {
            return Err(GraphAssemblyError::DuplicateUid(operand.uid));
        }
    }

    let (x, y, w) = (node.x.rank(), node.y.rank(), node.w.rank());
    if x != y || x != w || x < 3 {
        return Err(GraphAssemblyError::RankMismatch { input: x, weight: w, output: y });
    }
    if node.conv.spatial_dims != x - 2 {
        return Err(GraphAssemblyError::SpatialRankMismatch {
            descriptor: node.conv.spatial_dims,
            operands: x - 2,
        });
    }

    let expected = node.conv.compute_type;
    for operand in node.operands() {
        if operand.data_type != expected {
            return Err(GraphAssemblyError::DataTypeMismatch { expected, found: operand.data_type });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::OperandRole;
    use crate::dtype::DataType;
    use crate::shape::ConvParams;
    use crate::tensor::Tensor;

    fn node() -> OperationNode {
        let x = Tensor::from_vec(vec![1, 1, 4], vec![0.0f32; 4]);
        let w = Tensor::from_vec(vec![1, 1, 2], vec![0.0f32; 2]);
        let y = Tensor::from_vec(vec![1, 1, 3], vec![0.0f32; 3]);
        OperationNode::conv_forward(&x, &y, &w, &ConvParams::new(1)).unwrap()
    }

    #[test]
    fn assembles_single_node() {
        let graph = OperationGraph::builder().context(Arc::new(())).operation(node()).build().unwrap();
        assert_eq!(graph.operations().len(), 1);
        assert_eq!(graph.root().x.role, OperandRole::Input);
    }

    #[test]
    fn rejects_missing_parts() {
        let err = OperationGraph::<()>::builder().operation(node()).build().unwrap_err();
        assert_eq!(err, GraphAssemblyError::MissingContext);
        let err = OperationGraph::builder().context(Arc::new(())).build().unwrap_err();
        assert_eq!(err, GraphAssemblyError::NoOperations);
    }

    #[test]
    fn rejects_malformed_nodes() {
        let mut dup = node();
        dup.w.uid = dup.x.uid;
        let err = OperationGraph::builder().context(Arc::new(())).operation(dup).build().unwrap_err();
        assert_eq!(err, GraphAssemblyError::DuplicateUid(OperandRole::Input.uid()));

        let mut mixed = node();
        mixed.w.data_type = DataType::Double;
        let err = OperationGraph::builder().context(Arc::new(())).operation(mixed).build().unwrap_err();
        assert!(matches!(err, GraphAssemblyError::DataTypeMismatch { .. }));

        let mut ranks = node();
        ranks.conv.spatial_dims = 2;
        let err = OperationGraph::builder().context(Arc::new(())).operation(ranks).build().unwrap_err();
        assert!(matches!(err, GraphAssemblyError::SpatialRankMismatch { .. }));
    }
}
