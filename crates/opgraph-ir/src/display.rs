//! Display trait implementations for graph types.
//!
//! `Display for Graph` is the debug dump: one line per tensor, then one line
//! per operator in graph order.

use std::fmt;

use crate::graph::Graph;
use crate::ops::{OpKind, Operator};
use crate::tensor::Tensor;

/// Writes `[a,b,c]`.
fn write_list<T: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    items: impl IntoIterator<Item = T>,
) -> fmt::Result {
    f.write_str("[")?;
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{}", item)?;
    }
    f.write_str("]")
}

fn slot(op: &Operator, i: usize) -> String {
    op.input(i)
        .map(|t| t.to_string())
        .unwrap_or_else(|| "?".to_string())
}

fn output(op: &Operator) -> String {
    op.output()
        .map(|t| t.to_string())
        .unwrap_or_else(|| "?".to_string())
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor {}, Fuid {}, shape ", self.guid, self.fuid)?;
        write_list(f, &self.shape)?;
        write!(f, ", dtype {}, source ", self.dtype)?;
        match self.source {
            Some(op) => write!(f, "{}", op)?,
            None => f.write_str("None")?,
        }
        f.write_str(", targets ")?;
        write_list(f, &self.targets)?;
        match &self.storage {
            Some(blob) => write!(f, ", data {:p}", blob.as_ptr()),
            None => f.write_str(", data null"),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            OpKind::MatMul(mm) => write!(
                f,
                "MatMul([{},{}],A={},B={},C={},mnk=[{},{},{}])",
                if mm.trans_a() { "A^T" } else { "A" },
                if mm.trans_b() { "B^T" } else { "B" },
                slot(self, 0),
                slot(self, 1),
                output(self),
                mm.m(),
                mm.n(),
                mm.k()
            ),
            OpKind::Transpose(t) => {
                f.write_str("Transpose[perm=")?;
                write_list(f, t.permute())?;
                write!(f, "](input={},output={})", slot(self, 0), output(self))
            }
            OpKind::Unary(op) => write!(f, "{}(input={},output={})", op, slot(self, 0), output(self)),
            OpKind::ElementWise(op) => write!(
                f,
                "{}(A={},B={},C={})",
                op,
                slot(self, 0),
                slot(self, 1),
                output(self)
            ),
        }
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph Tensors:")?;
        for tensor in self.tensors() {
            writeln!(f, "{}", tensor)?;
        }
        writeln!(f, "Graph operators:")?;
        for op in self.operators() {
            write!(f, "OP {}, pred ", op.guid())?;
            write_list(f, op.predecessors())?;
            f.write_str(", succ ")?;
            write_list(f, op.successors())?;
            writeln!(f, ", {}", op)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::graph::Graph;
    use crate::ops::BinaryOp;
    use crate::runtime::CpuRuntime;
    use crate::tensor::DataType;

    #[test]
    fn test_dump_layout() {
        let mut g = Graph::new(CpuRuntime::handle());
        let a = g.add_tensor(vec![4, 3], DataType::Float32);
        let b = g.add_tensor(vec![4, 5], DataType::Float32);
        let mm = g.add_matmul(a, b, true, false).unwrap();
        let c = g.output_of(mm).unwrap();
        let tr = g.add_transpose(c, vec![1, 0]).unwrap();

        let dump = g.to_string();
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines[0], "Graph Tensors:");
        assert!(lines[1].starts_with(&format!("Tensor {}, Fuid ", a)));
        assert!(lines[1].ends_with(&format!(
            "shape [4,3], dtype Float32, source None, targets [{}], data null",
            mm
        )));
        assert_eq!(lines[5], "Graph operators:");
        assert_eq!(
            lines[6],
            format!(
                "OP {}, pred [], succ [{}], MatMul([A^T,B],A={},B={},C={},mnk=[3,5,4])",
                mm, tr, a, b, c
            )
        );
        assert!(lines[7].contains("Transpose[perm=[1,0]]"));
    }

    #[test]
    fn test_elementwise_description() {
        let mut g = Graph::new(CpuRuntime::handle());
        let a = g.add_tensor(vec![2], DataType::Float32);
        let b = g.add_tensor(vec![2], DataType::Float32);
        let add = g.add_elementwise(BinaryOp::Add, a, b).unwrap();
        let c = g.output_of(add).unwrap();
        let op = g.operator(add).unwrap();
        assert_eq!(op.to_string(), format!("Add(A={},B={},C={})", a, b, c));
    }
}
