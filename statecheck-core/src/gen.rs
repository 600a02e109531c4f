//! Generator combinators used to draw command inputs.

use crate::{data::*, tree::*};

/// A generator for test data of type `T`.
///
/// Generators are explicit, first-class values. A command's `generate`
/// returns one, typically closing over the model state it was asked about.
pub struct Gen<T> {
    generator: Box<dyn Fn(Size, Seed) -> Tree<T>>,
}

impl<T> Gen<T> {
    /// Create a new generator from a function.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Size, Seed) -> Tree<T> + 'static,
    {
        Gen {
            generator: Box::new(f),
        }
    }

    /// Generate a value using the given size and seed.
    pub fn generate(&self, size: Size, seed: Seed) -> Tree<T> {
        (self.generator)(size, seed)
    }

    /// Create a generator that always produces the same value.
    pub fn constant(value: T) -> Self
    where
        T: Clone + 'static,
    {
        Gen::new(move |_size, _seed| Tree::singleton(value.clone()))
    }
}

impl<T> Gen<T>
where
    T: 'static,
{
    /// Map a function over the generated values.
    pub fn map<U, F>(self, f: F) -> Gen<U>
    where
        F: Fn(T) -> U + 'static + Clone,
        U: 'static,
    {
        Gen::new(move |size, seed| self.generate(size, seed).map(f.clone()))
    }

    /// Bind/flatmap for dependent generation.
    pub fn bind<U, F>(self, f: F) -> Gen<U>
    where
        F: Fn(T) -> Gen<U> + 'static,
        U: 'static,
    {
        Gen::new(move |size, seed| {
            let (seed1, seed2) = seed.split();
            let tree = self.generate(size, seed1);
            tree.bind(|value| f(value).generate(size, seed2))
        })
    }

    /// Pick one of several generators, weighted by frequency.
    ///
    /// Zero weights are never picked. Panics if every weight is zero.
    pub fn frequency(choices: Vec<(u32, Gen<T>)>) -> Gen<T> {
        let total: u64 = choices.iter().map(|(w, _)| u64::from(*w)).sum();
        assert!(total > 0, "Gen::frequency needs at least one positive weight");
        Gen::new(move |size, seed| {
            let (seed1, seed2) = seed.split();
            let (mut pick, _) = seed1.next_bounded(total);
            for (weight, gen) in &choices {
                let weight = u64::from(*weight);
                if pick < weight {
                    return gen.generate(size, seed2);
                }
                pick -= weight;
            }
            unreachable!("weighted pick exceeded total weight")
        })
    }
}

impl<T> Gen<T>
where
    T: Clone + 'static,
{
    /// Pick one of the given values, shrinking towards the first.
    pub fn element(items: Vec<T>) -> Gen<T> {
        assert!(!items.is_empty(), "Gen::element needs at least one item");
        let last = items.len() - 1;
        Gen::new(move |size, seed| {
            let items = &items;
            Gen::usize_range(0, last)
                .generate(size, seed)
                .map(|index| items[index].clone())
        })
    }
}

/// Primitive generators.
impl Gen<bool> {
    /// Generate a random boolean, shrinking towards `false`.
    pub fn bool() -> Self {
        Gen::new(|_size, seed| {
            let (value, _new_seed) = seed.next_bool();
            if value {
                Tree::with_children(true, vec![Tree::singleton(false)])
            } else {
                Tree::singleton(false)
            }
        })
    }
}

impl Gen<i64> {
    /// Generate an integer in `min..=max`, shrinking towards the value
    /// closest to zero.
    pub fn int_range(min: i64, max: i64) -> Self {
        assert!(min <= max, "Gen::int_range needs min <= max");
        let origin = 0.clamp(min, max);
        Gen::new(move |_size, seed| {
            let span = (max as i128 - min as i128 + 1) as u128;
            let offset = if span > u64::MAX as u128 {
                seed.next_u64().0 as i128
            } else {
                seed.next_bounded(span as u64).0 as i128
            };
            halving_tree(origin as i128, min as i128 + offset).map(|v| v as i64)
        })
    }
}

impl Gen<usize> {
    /// Generate a `usize` in `min..=max`, shrinking towards `min`.
    pub fn usize_range(min: usize, max: usize) -> Self {
        assert!(min <= max, "Gen::usize_range needs min <= max");
        Gen::new(move |_size, seed| {
            let (offset, _) = seed.next_bounded((max - min) as u64 + 1);
            halving_tree(min as i128, (min + offset as usize) as i128).map(|v| v as usize)
        })
    }
}

/// Shrink tree for integers: jump straight to `origin`, or halve the
/// distance to it and keep shrinking from there.
fn halving_tree(origin: i128, value: i128) -> Tree<i128> {
    if value == origin {
        return Tree::singleton(value);
    }
    let mut children = vec![Tree::singleton(origin)];
    let half = origin + (value - origin) / 2;
    if half != origin && half != value {
        children.push(halving_tree(origin, half));
    }
    Tree::with_children(value, children)
}
