//! Toroidal hex-tiled map.
//!
//! Every cell stores two terrain triangles, a height, one map object with a
//! stamped owner index, a six-bit path mask, an optional player owner and an
//! optional mineral deposit. Columns and rows are powers of two so positions
//! wrap by masking.
//!
//! A compact [`MapPos`] (`row << col_bits | col`) addresses cells; the six
//! [`Direction`]s navigate the hex neighbourhood. [`Map::set_path`] is the
//! only path mutator and updates both endpoints atomically;
//! [`Map::set_obj`] is the only object mutator and stamps the index used to
//! find the owning flag, building or serf.

use serde::{Deserialize, Serialize};

use crate::random::Random;

/// Compact map position: `row << col_bits | col`.
pub type MapPos = u32;

/// The six hex directions, clockwise from east.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    /// East.
    Right = 0,
    /// South-east.
    DownRight = 1,
    /// South-west.
    Down = 2,
    /// West.
    Left = 3,
    /// North-west.
    UpLeft = 4,
    /// North-east.
    Up = 5,
}

impl Direction {
    /// All six directions in clockwise order.
    pub const ALL: [Direction; 6] = [
        Direction::Right,
        Direction::DownRight,
        Direction::Down,
        Direction::Left,
        Direction::UpLeft,
        Direction::Up,
    ];

    /// The opposite direction.
    #[must_use]
    pub const fn reverse(self) -> Direction {
        match self {
            Direction::Right => Direction::Left,
            Direction::DownRight => Direction::UpLeft,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::UpLeft => Direction::DownRight,
            Direction::Up => Direction::Down,
        }
    }

    /// Direction from its `0..6` discriminant.
    #[must_use]
    pub const fn from_index(index: u8) -> Option<Direction> {
        match index {
            0 => Some(Direction::Right),
            1 => Some(Direction::DownRight),
            2 => Some(Direction::Down),
            3 => Some(Direction::Left),
            4 => Some(Direction::UpLeft),
            5 => Some(Direction::Up),
            _ => None,
        }
    }

    /// Axial column/row deltas for one step.
    #[must_use]
    pub const fn deltas(self) -> (i32, i32) {
        match self {
            Direction::Right => (1, 0),
            Direction::DownRight => (0, 1),
            Direction::Down => (-1, 1),
            Direction::Left => (-1, 0),
            Direction::UpLeft => (0, -1),
            Direction::Up => (1, -1),
        }
    }
}

/// Terrain class of one triangle.
///
/// Ordering matters: everything below [`Terrain::Grass0`] is water.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum Terrain {
    /// Deep water.
    Water0 = 0,
    /// Water.
    Water1,
    /// Water.
    Water2,
    /// Shallow water.
    Water3,
    /// Grass shoreline.
    #[default]
    Grass0,
    /// Grass.
    Grass1,
    /// Grass.
    Grass2,
    /// Lush grass.
    Grass3,
    /// Desert edge.
    Desert0,
    /// Desert.
    Desert1,
    /// Deep desert.
    Desert2,
    /// Mountain foot.
    Tundra0,
    /// Mountain.
    Tundra1,
    /// High mountain.
    Tundra2,
    /// Snow line.
    Snow0,
    /// Snow cap.
    Snow1,
}

impl Terrain {
    /// Whether this triangle is water.
    #[must_use]
    pub const fn is_water(self) -> bool {
        (self as u8) < (Terrain::Grass0 as u8)
    }

    /// Whether this triangle is mountain (mineable).
    #[must_use]
    pub const fn is_mountain(self) -> bool {
        matches!(self, Terrain::Tundra0 | Terrain::Tundra1 | Terrain::Tundra2)
    }
}

/// Object occupying a map cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Object {
    /// Nothing.
    #[default]
    None,
    /// A road-network flag; the object index points into the flag pool.
    Flag,
    /// A small building footprint; index points into the building pool.
    SmallBuilding,
    /// A large building footprint; index points into the building pool.
    LargeBuilding,
    /// The castle; index points into the building pool.
    Castle,
    /// Mature tree.
    Tree0,
    /// Mature tree.
    Tree1,
    /// Mature tree.
    Tree2,
    /// Mature tree.
    Tree3,
    /// Growing sapling; matures into a tree during map updates.
    Sapling,
    /// Felled-tree stub; decays to nothing.
    Stub,
    /// Stone pile, eight sizes from exhausted to full.
    Stone0,
    /// Stone pile.
    Stone1,
    /// Stone pile.
    Stone2,
    /// Stone pile.
    Stone3,
    /// Stone pile.
    Stone4,
    /// Stone pile.
    Stone5,
    /// Stone pile.
    Stone6,
    /// Stone pile.
    Stone7,
    /// Sown grain field.
    FieldSeed,
    /// Growing grain field.
    FieldGrowing,
    /// Harvest-ready grain field.
    FieldRipe,
    /// Geologist sign: rich deposit.
    SignLarge,
    /// Geologist sign: small deposit.
    SignSmall,
    /// Geologist sign: nothing found.
    SignEmpty,
}

/// How much room an object leaves on its cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Space {
    /// Free for flags, roads and buildings.
    Open = 0,
    /// Roads may pass, nothing may be built.
    Filled = 1,
    /// Serfs may wander through, no roads or construction.
    Semipassable = 2,
    /// Nothing passes.
    Impassable = 3,
}

impl Object {
    /// Space classification used by every placement predicate.
    #[must_use]
    pub const fn space(self) -> Space {
        match self {
            Object::None | Object::SignLarge | Object::SignSmall | Object::SignEmpty => Space::Open,
            Object::Flag | Object::Stub | Object::FieldSeed | Object::FieldGrowing
            | Object::FieldRipe => Space::Filled,
            Object::Tree0 | Object::Tree1 | Object::Tree2 | Object::Tree3 | Object::Sapling => {
                Space::Semipassable
            }
            Object::SmallBuilding
            | Object::LargeBuilding
            | Object::Castle
            | Object::Stone0
            | Object::Stone1
            | Object::Stone2
            | Object::Stone3
            | Object::Stone4
            | Object::Stone5
            | Object::Stone6
            | Object::Stone7 => Space::Impassable,
        }
    }

    /// Whether this is a building footprint (including the castle).
    #[must_use]
    pub const fn is_building(self) -> bool {
        matches!(
            self,
            Object::SmallBuilding | Object::LargeBuilding | Object::Castle
        )
    }

    /// Whether this is a mature, cuttable tree.
    #[must_use]
    pub const fn is_tree(self) -> bool {
        matches!(self, Object::Tree0 | Object::Tree1 | Object::Tree2 | Object::Tree3)
    }

    /// Remaining stone in a pile, if this is one.
    #[must_use]
    pub const fn stone_amount(self) -> Option<u8> {
        match self {
            Object::Stone0 => Some(0),
            Object::Stone1 => Some(1),
            Object::Stone2 => Some(2),
            Object::Stone3 => Some(3),
            Object::Stone4 => Some(4),
            Object::Stone5 => Some(5),
            Object::Stone6 => Some(6),
            Object::Stone7 => Some(7),
            _ => None,
        }
    }
}

/// Underground mineral kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mineral {
    /// Gold ore.
    Gold,
    /// Iron ore.
    Iron,
    /// Coal.
    Coal,
    /// Mineable stone.
    Stone,
}

/// One map cell.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tile {
    /// Terrain of the up-pointing triangle.
    pub type_up: Terrain,
    /// Terrain of the down-pointing triangle.
    pub type_down: Terrain,
    /// Height, `0..=31`.
    pub height: u8,
    /// Object on this cell.
    pub obj: Object,
    /// Pool index of the flag/building owning `obj` (0 when not applicable).
    pub obj_index: u32,
    /// Serf currently occupying the cell (0 when none).
    pub serf_index: u32,
    /// A transporter is parked idle on a road through this cell.
    pub idle_serf: bool,
    /// Owning player, if any.
    pub owner: Option<u8>,
    /// Mineral deposit under the cell.
    pub mineral: Option<Mineral>,
    /// Remaining mineral amount.
    pub mineral_amount: u8,
    /// Path bits, one per [`Direction`].
    pub paths: u8,
}

/// Parameter bundle for the map generator.
///
/// Every value maps to a 16-bit slider position in a setup screen; the
/// defaults give a balanced map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapGeneratorParams {
    /// Tree abundance.
    pub trees: u16,
    /// Stone pile abundance.
    pub stonepile_dense: u16,
    /// Fish abundance in water.
    pub fish: u16,
    /// Gold deposit abundance in mountains.
    pub mountain_gold: u16,
    /// Iron deposit abundance in mountains.
    pub mountain_iron: u16,
    /// Coal deposit abundance in mountains.
    pub mountain_coal: u16,
    /// Stone deposit abundance in mountains.
    pub mountain_stone: u16,
    /// Desert patch frequency.
    pub deserts: u16,
    /// Water level; higher floods more of the map.
    pub lakes_water_level: u16,
    /// Decorative junk object frequency.
    pub junk_objects: u16,
}

impl Default for MapGeneratorParams {
    fn default() -> Self {
        Self {
            trees: 0x6000,
            stonepile_dense: 0x3000,
            fish: 0x3000,
            mountain_gold: 0x1000,
            mountain_iron: 0x2000,
            mountain_coal: 0x3000,
            mountain_stone: 0x2000,
            deserts: 0x1000,
            lakes_water_level: 0x1000,
            junk_objects: 0x3000,
        }
    }
}

/// The toroidal hex grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Map {
    size: u32,
    col_bits: u32,
    row_bits: u32,
    cols: u32,
    rows: u32,
    tiles: Vec<Tile>,
    update_counter: u16,
    update_pos: MapPos,
    /// Total minable gold on the map; the morale formula divides by this.
    gold_deposit: u32,
}

impl Map {
    /// Create a flat grass map of the given size class.
    ///
    /// Size `s` yields `2^(5 + s/2)` columns by `2^(5 + (s+1)/2)` rows,
    /// so a size-3 map is 64x128.
    #[must_use]
    pub fn new(size: u32) -> Self {
        let col_bits = 5 + size / 2;
        let row_bits = 5 + (size + 1) / 2;
        let cols = 1 << col_bits;
        let rows = 1 << row_bits;
        Self {
            size,
            col_bits,
            row_bits,
            cols,
            rows,
            tiles: vec![Tile::default(); (cols * rows) as usize],
            update_counter: 0,
            update_pos: 0,
            gold_deposit: 0,
        }
    }

    /// Map size class this map was created with.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Number of columns.
    #[must_use]
    pub const fn cols(&self) -> u32 {
        self.cols
    }

    /// Number of rows.
    #[must_use]
    pub const fn rows(&self) -> u32 {
        self.rows
    }

    /// Total number of cells.
    #[must_use]
    pub const fn cell_count(&self) -> u32 {
        self.cols * self.rows
    }

    /// Build a position from a (wrapping) column and row.
    #[must_use]
    pub const fn pos(&self, col: u32, row: u32) -> MapPos {
        ((row & (self.rows - 1)) << self.col_bits) | (col & (self.cols - 1))
    }

    /// Column of a position.
    #[must_use]
    pub const fn pos_col(&self, pos: MapPos) -> u32 {
        pos & (self.cols - 1)
    }

    /// Row of a position.
    #[must_use]
    pub const fn pos_row(&self, pos: MapPos) -> u32 {
        (pos >> self.col_bits) & (self.rows - 1)
    }

    /// The neighbouring position one step in `dir`, wrapping at the edges.
    #[must_use]
    pub fn neighbor(&self, pos: MapPos, dir: Direction) -> MapPos {
        let (dc, dr) = dir.deltas();
        let col = (self.pos_col(pos) as i64 + dc as i64) as u32;
        let row = (self.pos_row(pos) as i64 + dr as i64) as u32;
        self.pos(col, row)
    }

    /// Signed column distance from `a` to `b`, folded to the shorter way
    /// around the torus.
    #[must_use]
    pub fn dist_col(&self, a: MapPos, b: MapPos) -> i32 {
        let d = (self.pos_col(b) as i32 - self.pos_col(a) as i32)
            .rem_euclid(self.cols as i32);
        if d > self.cols as i32 / 2 {
            d - self.cols as i32
        } else {
            d
        }
    }

    /// Signed row distance from `a` to `b`, folded like [`Self::dist_col`].
    #[must_use]
    pub fn dist_row(&self, a: MapPos, b: MapPos) -> i32 {
        let d = (self.pos_row(b) as i32 - self.pos_row(a) as i32)
            .rem_euclid(self.rows as i32);
        if d > self.rows as i32 / 2 {
            d - self.rows as i32
        } else {
            d
        }
    }

    /// Straight-line hex distance in tiles between two positions.
    #[must_use]
    pub fn hex_dist(&self, a: MapPos, b: MapPos) -> u32 {
        let dc = self.dist_col(a, b);
        let dr = self.dist_row(a, b);
        ((dc.abs() + dr.abs() + (dc + dr).abs()) / 2) as u32
    }

    fn tile(&self, pos: MapPos) -> &Tile {
        &self.tiles[pos as usize]
    }

    fn tile_mut(&mut self, pos: MapPos) -> &mut Tile {
        &mut self.tiles[pos as usize]
    }

    /// Height of a cell.
    #[must_use]
    pub fn get_height(&self, pos: MapPos) -> u8 {
        self.tile(pos).height
    }

    /// Set the height of a cell (leveling during construction).
    pub fn set_height(&mut self, pos: MapPos, height: u8) {
        self.tile_mut(pos).height = height & 31;
    }

    /// Terrain of the up-pointing triangle.
    #[must_use]
    pub fn type_up(&self, pos: MapPos) -> Terrain {
        self.tile(pos).type_up
    }

    /// Terrain of the down-pointing triangle.
    #[must_use]
    pub fn type_down(&self, pos: MapPos) -> Terrain {
        self.tile(pos).type_down
    }

    /// Set both terrain triangles.
    pub fn set_types(&mut self, pos: MapPos, up: Terrain, down: Terrain) {
        let tile = self.tile_mut(pos);
        tile.type_up = up;
        tile.type_down = down;
    }

    /// Whether the cell sits entirely in water.
    ///
    /// All six triangles touching the vertex must be water, matching the
    /// flag-placement rule.
    #[must_use]
    pub fn is_in_water(&self, pos: MapPos) -> bool {
        let left = self.neighbor(pos, Direction::Left);
        let up_left = self.neighbor(pos, Direction::UpLeft);
        let up = self.neighbor(pos, Direction::Up);
        self.type_up(pos).is_water()
            && self.type_down(pos).is_water()
            && self.type_down(left).is_water()
            && self.type_up(up_left).is_water()
            && self.type_down(up_left).is_water()
            && self.type_up(up).is_water()
    }

    /// Whether either triangle of the cell is water.
    #[must_use]
    pub fn is_water_tile(&self, pos: MapPos) -> bool {
        self.type_up(pos).is_water() || self.type_down(pos).is_water()
    }

    /// The object on a cell.
    #[must_use]
    pub fn get_obj(&self, pos: MapPos) -> Object {
        self.tile(pos).obj
    }

    /// The pool index stamped with the object (flag/building pool).
    #[must_use]
    pub fn get_obj_index(&self, pos: MapPos) -> u32 {
        self.tile(pos).obj_index
    }

    /// Place `obj` on the cell and stamp the owning pool index.
    ///
    /// This is the single mutator for tile content.
    pub fn set_obj(&mut self, pos: MapPos, obj: Object, index: u32) {
        let tile = self.tile_mut(pos);
        tile.obj = obj;
        tile.obj_index = index;
    }

    /// Whether a flag stands on the cell.
    #[must_use]
    pub fn has_flag(&self, pos: MapPos) -> bool {
        self.get_obj(pos) == Object::Flag
    }

    /// Whether a building footprint occupies the cell.
    #[must_use]
    pub fn has_building(&self, pos: MapPos) -> bool {
        self.get_obj(pos).is_building()
    }

    /// Owner of the cell.
    #[must_use]
    pub fn get_owner(&self, pos: MapPos) -> Option<u8> {
        self.tile(pos).owner
    }

    /// Set or clear the owner of the cell.
    pub fn set_owner(&mut self, pos: MapPos, owner: Option<u8>) {
        self.tile_mut(pos).owner = owner;
    }

    /// Path bitmask of the cell.
    #[must_use]
    pub fn paths(&self, pos: MapPos) -> u8 {
        self.tile(pos).paths & 0x3f
    }

    /// Whether the cell has a path in `dir`.
    #[must_use]
    pub fn has_path(&self, pos: MapPos, dir: Direction) -> bool {
        self.tile(pos).paths & (1 << dir as u8) != 0
    }

    /// Whether the cell has any path at all.
    #[must_use]
    pub fn has_any_path(&self, pos: MapPos) -> bool {
        self.paths(pos) != 0
    }

    /// Set or clear the path bit in `dir`, updating both endpoints.
    pub fn set_path(&mut self, pos: MapPos, dir: Direction, on: bool) {
        let other = self.neighbor(pos, dir);
        let bit = 1 << dir as u8;
        let rev_bit = 1 << dir.reverse() as u8;
        if on {
            self.tile_mut(pos).paths |= bit;
            self.tile_mut(other).paths |= rev_bit;
        } else {
            self.tile_mut(pos).paths &= !bit;
            self.tile_mut(other).paths &= !rev_bit;
        }
    }

    /// Serf occupying the cell (0 when none).
    #[must_use]
    pub fn serf_index(&self, pos: MapPos) -> u32 {
        self.tile(pos).serf_index
    }

    /// Record which serf occupies the cell.
    pub fn set_serf_index(&mut self, pos: MapPos, index: u32) {
        self.tile_mut(pos).serf_index = index;
    }

    /// Whether a transporter idles on a road through the cell.
    #[must_use]
    pub fn has_idle_serf(&self, pos: MapPos) -> bool {
        self.tile(pos).idle_serf
    }

    /// Mark or clear the idle-transporter bit.
    pub fn set_idle_serf(&mut self, pos: MapPos, idle: bool) {
        self.tile_mut(pos).idle_serf = idle;
    }

    /// Mineral deposit under the cell.
    #[must_use]
    pub fn mineral(&self, pos: MapPos) -> Option<(Mineral, u8)> {
        let tile = self.tile(pos);
        tile.mineral.map(|m| (m, tile.mineral_amount))
    }

    /// Set the mineral deposit under the cell.
    pub fn set_mineral(&mut self, pos: MapPos, mineral: Option<Mineral>, amount: u8) {
        let was_gold = matches!(self.tile(pos).mineral, Some(Mineral::Gold));
        let old_amount = self.tile(pos).mineral_amount as u32;
        if was_gold {
            self.gold_deposit -= old_amount;
        }
        let tile = self.tile_mut(pos);
        tile.mineral = mineral;
        tile.mineral_amount = if mineral.is_some() { amount } else { 0 };
        if matches!(mineral, Some(Mineral::Gold)) {
            self.gold_deposit += amount as u32;
        }
    }

    /// Extract one unit of mineral from the cell, if any remains.
    pub fn take_mineral(&mut self, pos: MapPos) -> Option<Mineral> {
        let tile = self.tile(pos);
        let mineral = tile.mineral?;
        if tile.mineral_amount == 0 {
            return None;
        }
        if mineral == Mineral::Gold {
            self.gold_deposit -= 1;
        }
        let tile = self.tile_mut(pos);
        tile.mineral_amount -= 1;
        if tile.mineral_amount == 0 {
            tile.mineral = None;
        }
        Some(mineral)
    }

    /// Total minable gold left in the ground.
    #[must_use]
    pub const fn gold_deposit(&self) -> u32 {
        self.gold_deposit
    }

    /// Positions of the spiral around `center`, ring by ring.
    ///
    /// Index 0 is the center; ring `r` occupies indices
    /// `1 + 3r(r-1) .. 1 + 3r(r+1)`. The order is fixed and deterministic; the
    /// initial-castle search and the AI's area scoring both consume it.
    #[must_use]
    pub fn spiral(&self, center: MapPos, radius: u32) -> Vec<MapPos> {
        let mut out = Vec::with_capacity((1 + 3 * radius * (radius + 1)) as usize);
        out.push(center);
        let mut pos = center;
        const RING_WALK: [Direction; 6] = [
            Direction::Down,
            Direction::Left,
            Direction::UpLeft,
            Direction::Up,
            Direction::Right,
            Direction::DownRight,
        ];
        for r in 1..=radius {
            pos = self.neighbor(pos, Direction::Right);
            for dir in RING_WALK {
                for _ in 0..r {
                    out.push(pos);
                    pos = self.neighbor(pos, dir);
                }
            }
        }
        out
    }

    /// Advance the natural world by one update slice.
    ///
    /// A handful of cells per call, walking the map cyclically: saplings
    /// mature into trees and felled stubs decay. Draws come from the shared
    /// game random so replays stay identical.
    pub fn update(&mut self, tick_diff: u32, rnd: &mut Random) {
        self.update_counter = self.update_counter.wrapping_add(tick_diff as u16);
        let steps = (self.update_counter / 16) as u32;
        self.update_counter %= 16;
        for _ in 0..steps {
            let pos = self.update_pos;
            self.update_pos = (self.update_pos + 1) % self.cell_count();
            match self.get_obj(pos) {
                Object::Sapling => {
                    if rnd.random_int() & 7 == 0 {
                        let tree = match rnd.random_int() & 3 {
                            0 => Object::Tree0,
                            1 => Object::Tree1,
                            2 => Object::Tree2,
                            _ => Object::Tree3,
                        };
                        self.set_obj(pos, tree, 0);
                    }
                }
                Object::Stub => {
                    if rnd.random_int() & 15 == 0 {
                        self.set_obj(pos, Object::None, 0);
                    }
                }
                Object::FieldSeed => {
                    if rnd.random_int() & 3 == 0 {
                        self.set_obj(pos, Object::FieldGrowing, 0);
                    }
                }
                Object::FieldGrowing => {
                    if rnd.random_int() & 3 == 0 {
                        self.set_obj(pos, Object::FieldRipe, 0);
                    }
                }
                _ => {}
            }
        }
    }
}

/// Deterministic random-map generator.
///
/// Produces lakes, grassland, mountains bearing minerals, trees and stone
/// piles from a seed and a [`MapGeneratorParams`] bundle. The same seed and
/// parameters always yield the same map.
#[derive(Debug)]
pub struct ClassicMapGenerator;

impl ClassicMapGenerator {
    /// Generate a map of the given size class.
    #[must_use]
    pub fn generate(size: u32, rnd: &mut Random, params: &MapGeneratorParams) -> Map {
        let mut map = Map::new(size);

        Self::generate_heights(&mut map, rnd);
        Self::classify_terrain(&mut map, params);
        Self::place_minerals(&mut map, rnd, params);
        Self::place_objects(&mut map, rnd, params);

        map
    }

    fn generate_heights(map: &mut Map, rnd: &mut Random) {
        let cols = map.cols();
        let rows = map.rows();

        // Random seed heights on a coarse lattice, then smoothing passes.
        for row in 0..rows {
            for col in 0..cols {
                if col % 8 == 0 && row % 8 == 0 {
                    let h = (rnd.random_int() % 32) as u8;
                    let pos = map.pos(col, row);
                    map.set_height(pos, h);
                }
            }
        }

        for _ in 0..4 {
            for row in 0..rows {
                for col in 0..cols {
                    let pos = map.pos(col, row);
                    let mut sum = map.get_height(pos) as u32;
                    let mut n = 1u32;
                    for dir in Direction::ALL {
                        sum += map.get_height(map.neighbor(pos, dir)) as u32;
                        n += 1;
                    }
                    map.set_height(pos, (sum / n) as u8);
                }
            }
        }
    }

    fn classify_terrain(map: &mut Map, params: &MapGeneratorParams) {
        let water_level = 2 + (params.lakes_water_level >> 12) as u8;
        let mountain_level = 17 + (3 - (params.deserts >> 14).min(3)) as u8;

        for pos in 0..map.cell_count() {
            let h = map.get_height(pos);
            let terrain = if h <= water_level {
                match water_level - h {
                    0 => Terrain::Water3,
                    1 => Terrain::Water2,
                    2 => Terrain::Water1,
                    _ => Terrain::Water0,
                }
            } else if h >= mountain_level {
                match h - mountain_level {
                    0 | 1 => Terrain::Tundra0,
                    2 | 3 => Terrain::Tundra1,
                    4 | 5 => Terrain::Tundra2,
                    6 => Terrain::Snow0,
                    _ => Terrain::Snow1,
                }
            } else {
                match h % 4 {
                    0 => Terrain::Grass0,
                    1 => Terrain::Grass1,
                    2 => Terrain::Grass2,
                    _ => Terrain::Grass3,
                }
            };
            map.set_types(pos, terrain, terrain);
        }
    }

    fn place_minerals(map: &mut Map, rnd: &mut Random, params: &MapGeneratorParams) {
        let table: [(Mineral, u16); 4] = [
            (Mineral::Gold, params.mountain_gold),
            (Mineral::Iron, params.mountain_iron),
            (Mineral::Coal, params.mountain_coal),
            (Mineral::Stone, params.mountain_stone),
        ];
        for pos in 0..map.cell_count() {
            if !map.type_up(pos).is_mountain() {
                continue;
            }
            let draw = rnd.random_int();
            for (mineral, abundance) in table {
                if draw < abundance {
                    let amount = 1 + (rnd.random_int() % 12) as u8;
                    map.set_mineral(pos, Some(mineral), amount);
                    break;
                }
            }
        }
    }

    fn place_objects(map: &mut Map, rnd: &mut Random, params: &MapGeneratorParams) {
        for pos in 0..map.cell_count() {
            if map.is_water_tile(pos) || map.type_up(pos).is_mountain() {
                continue;
            }
            let draw = rnd.random_int();
            if draw < params.trees / 8 {
                let tree = match rnd.random_int() & 3 {
                    0 => Object::Tree0,
                    1 => Object::Tree1,
                    2 => Object::Tree2,
                    _ => Object::Tree3,
                };
                map.set_obj(pos, tree, 0);
            } else if draw < params.trees / 8 + params.stonepile_dense / 32 {
                let pile = match rnd.random_int() % 6 {
                    0 => Object::Stone2,
                    1 => Object::Stone3,
                    2 => Object::Stone4,
                    3 => Object::Stone5,
                    4 => Object::Stone6,
                    _ => Object::Stone7,
                };
                map.set_obj(pos, pile, 0);
            } else if draw < params.trees / 8 + params.stonepile_dense / 32 + params.junk_objects / 64
            {
                map.set_obj(pos, Object::Stub, 0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_3_dimensions() {
        let map = Map::new(3);
        assert_eq!(map.cols(), 64);
        assert_eq!(map.rows(), 128);
    }

    #[test]
    fn test_neighbor_reverse_round_trip() {
        let map = Map::new(3);
        let pos = map.pos(10, 20);
        for dir in Direction::ALL {
            let there = map.neighbor(pos, dir);
            assert_eq!(map.neighbor(there, dir.reverse()), pos);
        }
    }

    #[test]
    fn test_neighbor_wraps_at_edges() {
        let map = Map::new(3);
        let pos = map.pos(63, 0);
        let right = map.neighbor(pos, Direction::Right);
        assert_eq!(map.pos_col(right), 0);
        let up_left = map.neighbor(pos, Direction::UpLeft);
        assert_eq!(map.pos_row(up_left), 127);
    }

    #[test]
    fn test_set_path_is_symmetric() {
        let mut map = Map::new(3);
        let pos = map.pos(5, 5);
        let other = map.neighbor(pos, Direction::DownRight);

        map.set_path(pos, Direction::DownRight, true);
        assert!(map.has_path(pos, Direction::DownRight));
        assert!(map.has_path(other, Direction::UpLeft));

        map.set_path(other, Direction::UpLeft, false);
        assert!(!map.has_path(pos, Direction::DownRight));
        assert!(!map.has_path(other, Direction::UpLeft));
    }

    #[test]
    fn test_spiral_ring_sizes() {
        let map = Map::new(3);
        let spiral = map.spiral(map.pos(30, 30), 4);
        // 1 center + 6 + 12 + 18 + 24
        assert_eq!(spiral.len(), 1 + 6 + 12 + 18 + 24);
        // Ring 1 cells are all adjacent to the center.
        for pos in &spiral[1..7] {
            assert_eq!(map.hex_dist(spiral[0], *pos), 1);
        }
        // Ring 3 cells are all at distance 3.
        for pos in &spiral[19..37] {
            assert_eq!(map.hex_dist(spiral[0], *pos), 3);
        }
    }

    #[test]
    fn test_spiral_is_deterministic() {
        let map = Map::new(3);
        let a = map.spiral(map.pos(12, 40), 5);
        let b = map.spiral(map.pos(12, 40), 5);
        assert_eq!(a, b);
    }

    #[test]
    fn test_hex_dist_neighbors() {
        let map = Map::new(4);
        let pos = map.pos(20, 20);
        for dir in Direction::ALL {
            assert_eq!(map.hex_dist(pos, map.neighbor(pos, dir)), 1);
        }
        // Two steps east then one north-east: still reachable in 3.
        let mut p = pos;
        p = map.neighbor(p, Direction::Right);
        p = map.neighbor(p, Direction::Right);
        p = map.neighbor(p, Direction::Up);
        assert_eq!(map.hex_dist(pos, p), 3);
    }

    #[test]
    fn test_gold_deposit_tracking() {
        let mut map = Map::new(3);
        let pos = map.pos(1, 1);
        map.set_mineral(pos, Some(Mineral::Gold), 5);
        assert_eq!(map.gold_deposit(), 5);
        assert_eq!(map.take_mineral(pos), Some(Mineral::Gold));
        assert_eq!(map.gold_deposit(), 4);
        map.set_mineral(pos, None, 0);
        assert_eq!(map.gold_deposit(), 0);
    }

    #[test]
    fn test_generator_is_deterministic() {
        let params = MapGeneratorParams::default();
        let mut rnd1 = Random::from_seed(99);
        let mut rnd2 = Random::from_seed(99);
        let a = ClassicMapGenerator::generate(3, &mut rnd1, &params);
        let b = ClassicMapGenerator::generate(3, &mut rnd2, &params);
        assert_eq!(a, b);
    }

    #[test]
    fn test_generator_places_some_of_everything() {
        let params = MapGeneratorParams::default();
        let mut rnd = Random::from_seed(8_667_715_887_436_237);
        let map = ClassicMapGenerator::generate(4, &mut rnd, &params);

        let mut water = 0;
        let mut mountain = 0;
        let mut trees = 0;
        for pos in 0..map.cell_count() {
            if map.is_water_tile(pos) {
                water += 1;
            }
            if map.type_up(pos).is_mountain() {
                mountain += 1;
            }
            if map.get_obj(pos).is_tree() {
                trees += 1;
            }
        }
        assert!(water > 0, "expected some water");
        assert!(mountain > 0, "expected some mountains");
        assert!(trees > 0, "expected some trees");
    }
}
