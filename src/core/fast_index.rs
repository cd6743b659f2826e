/// Search accelerator over a page's key blocks.
///
/// For key block `i`, a positive run count is the number of immediately
/// following key blocks sharing its ebc. Otherwise the value is the negated
/// cross count: how many immediately following key blocks have a larger ebc
/// (deeper keys the search may skip).
#[derive(Debug, Clone, Default)]
pub struct FastIndex {
    run_counts: Vec<i32>,
}

impl FastIndex {
    /// Builds from the ebc of every key block in page order.
    pub fn build(ebcs: &[u16]) -> Self {
        let n = ebcs.len();
        let mut run_counts = vec![0i32; n];

        // next_le[i]: first j > i with ebcs[j] <= ebcs[i]
        let mut next_le = vec![n; n];
        let mut stack: Vec<usize> = Vec::with_capacity(n);
        for i in (0..n).rev() {
            while let Some(&top) = stack.last() {
                if ebcs[top] > ebcs[i] {
                    stack.pop();
                } else {
                    break;
                }
            }
            if let Some(&top) = stack.last() {
                next_le[i] = top;
            }
            stack.push(i);
        }

        for i in (0..n).rev() {
            if i + 1 < n && ebcs[i + 1] == ebcs[i] {
                let next = run_counts[i + 1];
                run_counts[i] = if next > 0 { next + 1 } else { 1 };
            } else {
                let cross = next_le[i] - i - 1;
                run_counts[i] = -(cross as i32);
            }
        }
        Self { run_counts }
    }

    #[inline]
    pub fn run_count(&self, index: usize) -> i32 {
        self.run_counts.get(index).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.run_counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.run_counts.is_empty()
    }
}
