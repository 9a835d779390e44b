//! Sparse colored Conway engine on a power-of-two torus.
//!
//! Only live cells and their candidate neighbourhoods are tracked; the
//! stepper never scans the full grid. Both the live set and the candidate
//! set are double-buffered swap sets: each generation is swept out of the
//! current buffers into the next, then the buffers flip.

mod swap_set;

use rand::{thread_rng, Rng};
use swap_set::SwapSet;

/// A live cell: torus coordinates, 24-bit RGB color, generation age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LiveCell {
    pub x: u16,
    pub y: u16,
    pub color: u32,
    pub age: u16,
}

pub struct Life {
    axis_length: u32,
    wrap_mask: u16,
    alive: SwapSet<LiveCell>,
    candidates: SwapSet<()>,
}

fn coord_key(x: u16, y: u16) -> u32 {
    u32::from(x) << 16 | u32::from(y)
}

/// Channel-split color for a newborn cell: red from the first parent, green
/// from the second, blue from the third, after reordering the parents with a
/// fixed pairwise comparison sequence over `less(u,v) = u.x < v.x || u.y < v.y`.
/// The predicate is not a total order and the comparison sequence is part of
/// the observable behavior; golden tests pin it.
fn birth_color(parents: &[LiveCell; 3]) -> u32 {
    let [a, b, c] = *parents;
    let less = |u: &LiveCell, v: &LiveCell| u.x < v.x || u.y < v.y;
    let (p0, p1, p2) = if less(&a, &b) {
        if less(&b, &c) {
            (a, b, c)
        } else if less(&a, &c) {
            (a, c, b)
        } else {
            (c, a, b)
        }
    } else if less(&a, &c) {
        (b, a, c)
    } else if less(&b, &c) {
        (b, c, a)
    } else {
        (c, b, a)
    };
    (p0.color & 0xff0000) | (p1.color & 0x00ff00) | (p2.color & 0x0000ff)
}

impl Life {
    /// `world_size` must be a power of two in `[2, 65536]`; the config layer
    /// validates this before construction.
    pub fn new(world_size: u32) -> Self {
        debug_assert!(world_size.is_power_of_two());
        Self {
            axis_length: world_size,
            wrap_mask: (world_size - 1) as u16,
            alive: SwapSet::with_capacity(world_size as usize),
            candidates: SwapSet::with_capacity(world_size as usize),
        }
    }

    /// Whether `(x, y)` is currently dead and therefore placeable.
    pub fn can_set_cell(&self, x: u16, y: u16) -> bool {
        self.alive
            .get(coord_key(x & self.wrap_mask, y & self.wrap_mask))
            .is_none()
    }

    /// Inserts a live cell. Coordinates are masked onto the torus. The caller
    /// is responsible for checking `can_set_cell` first.
    pub fn set_cell(&mut self, x: u16, y: u16, color: u32, age: u16) {
        let x = x & self.wrap_mask;
        let y = y & self.wrap_mask;
        self.alive.insert(coord_key(x, y), LiveCell { x, y, color, age });
        self.add_candidates(x, y);
    }

    pub fn clear(&mut self) {
        self.alive.clear_all();
        self.candidates.clear_all();
    }

    /// Clears the world, then fills each coordinate with probability 1/2
    /// using a uniformly random nonzero 24-bit color at age 0.
    pub fn randomise(&mut self) {
        self.clear();
        let mut rng = thread_rng();
        for x in 0..self.axis_length {
            for y in 0..self.axis_length {
                if rng.gen_range(0..2u32) != 1 {
                    continue;
                }
                let color = rng.gen_range(1..=0x00ff_ffffu32);
                self.set_cell(x as u16, y as u16, color, 0);
            }
        }
    }

    pub fn cells(&self) -> impl Iterator<Item = &LiveCell> {
        self.alive.current().values()
    }

    pub fn count(&self) -> usize {
        self.alive.len()
    }

    /// Advances one generation.
    ///
    /// Sweep: every candidate coordinate probes its eight wrapped neighbours
    /// in a fixed order (up-left, up, up-right, left, right, down-left, down,
    /// down-right); that probe order is also the parent observation order for
    /// births. The next candidate set starts as the keys of the current live
    /// set (survivors must be revisited to age them) and every death or birth
    /// adds its full 9-cell neighbourhood.
    pub fn next_gen(&mut self) {
        let mask = self.wrap_mask;
        self.alive.clear_next();
        self.candidates.clear_next();

        let (alive_cur, alive_next) = self.alive.parts_mut();
        let (cand_cur, cand_next) = self.candidates.parts_mut();

        for &key in alive_cur.keys() {
            cand_next.insert(key, ());
        }

        for &key in cand_cur.keys() {
            let x = (key >> 16) as u16;
            let y = key as u16;
            let x_left = x.wrapping_sub(1) & mask;
            let x_right = x.wrapping_add(1) & mask;
            let y_up = y.wrapping_sub(1) & mask;
            let y_down = y.wrapping_add(1) & mask;

            let mut parents = [LiveCell::default(); 3];
            let mut observed = 0usize;
            let mut neighbours = 0u32;
            let mut probe = |px: u16, py: u16| {
                if let Some(&cell) = alive_cur.get(&coord_key(px, py)) {
                    if observed < parents.len() {
                        parents[observed] = cell;
                        observed += 1;
                    }
                    neighbours += 1;
                }
            };
            probe(x_left, y_up);
            probe(x, y_up);
            probe(x_right, y_up);
            probe(x_left, y);
            probe(x_right, y);
            probe(x_left, y_down);
            probe(x, y_down);
            probe(x_right, y_down);

            let mut changed = false;
            match alive_cur.get(&key).copied() {
                Some(mut cell) => {
                    if neighbours == 2 || neighbours == 3 {
                        cell.age = cell.age.saturating_add(1);
                        alive_next.insert(key, cell);
                    } else {
                        changed = true;
                    }
                }
                None => {
                    if neighbours == 3 {
                        let color = birth_color(&parents);
                        alive_next.insert(key, LiveCell { x, y, color, age: 0 });
                        changed = true;
                    }
                }
            }
            if changed {
                for py in [y_up, y, y_down] {
                    for px in [x_left, x, x_right] {
                        cand_next.insert(coord_key(px, py), ());
                    }
                }
            }
        }

        self.alive.swap();
        self.candidates.swap();
    }

    fn add_candidates(&mut self, x: u16, y: u16) {
        let mask = self.wrap_mask;
        let x_left = x.wrapping_sub(1) & mask;
        let x_right = x.wrapping_add(1) & mask;
        let y_up = y.wrapping_sub(1) & mask;
        let y_down = y.wrapping_add(1) & mask;
        for py in [y_up, y, y_down] {
            for px in [x_left, x, x_right] {
                self.candidates.insert(coord_key(px, py), ());
            }
        }
    }
}
