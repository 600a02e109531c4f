//! Rose trees pairing a generated command input with its shrinks.

/// A rose tree containing a value and its shrink possibilities.
///
/// Every planned action keeps the tree its input was drawn from, so a
/// failing sequence can later swap an input for one of its simpler children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree<T> {
    pub value: T,
    pub children: Vec<Tree<T>>,
}

impl<T> Tree<T> {
    /// Create a new tree with the given value and no children.
    pub fn singleton(value: T) -> Self {
        Tree {
            value,
            children: Vec::new(),
        }
    }

    /// Create a new tree with the given value and children.
    pub fn with_children(value: T, children: Vec<Tree<T>>) -> Self {
        Tree { value, children }
    }

    /// Map a function over the tree values.
    pub fn map<U, F>(self, f: F) -> Tree<U>
    where
        F: Fn(T) -> U + Clone,
    {
        Tree {
            value: f(self.value),
            children: self
                .children
                .into_iter()
                .map(|child| child.map(f.clone()))
                .collect(),
        }
    }

    /// Monadic bind: the shrinks of the produced tree come first, followed by
    /// the shrinks of the outer value.
    pub fn bind<U, F>(self, f: F) -> Tree<U>
    where
        F: Fn(T) -> Tree<U> + Clone,
    {
        let Tree {
            value: new_value,
            children: mut new_children,
        } = f(self.value);

        new_children.extend(
            self.children
                .into_iter()
                .map(|child| child.bind(f.clone())),
        );

        Tree {
            value: new_value,
            children: new_children,
        }
    }

    /// Check if the tree has any children (shrinks).
    pub fn has_shrinks(&self) -> bool {
        !self.children.is_empty()
    }
}

impl<T> From<T> for Tree<T> {
    fn from(value: T) -> Self {
        Tree::singleton(value)
    }
}
