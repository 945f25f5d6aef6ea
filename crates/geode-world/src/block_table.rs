//! Per-block-id light propagation table.
//!
//! Height map and sky light computation need two facts per legacy block id:
//! how much a block attenuates sky light passing through it, and whether it
//! diffuses (scatters) sky light without blocking it. Built once at startup
//! and passed by reference to the chunk routines.

/// Light properties for a single block id.
struct LightInfo {
    id: u8,
    /// Sky light attenuation, 1 (fully transparent) to 15 (opaque).
    filter: u8,
    /// Scatters sky light; ends the fully-lit span without blocking it.
    diffuses: bool,
}

macro_rules! light {
    ($id:expr, $filter:expr) => {
        LightInfo {
            id: $id,
            filter: $filter,
            diffuses: false,
        }
    };
    ($id:expr, $filter:expr, diffuses) => {
        LightInfo {
            id: $id,
            filter: $filter,
            diffuses: true,
        }
    };
}

/// Non-opaque block ids. Anything absent is opaque (filter 15, no diffusion).
const LIGHT_DATA: &[LightInfo] = &[
    light!(0, 1),             // air
    light!(6, 1),             // sapling
    light!(8, 2),             // flowing water
    light!(9, 2),             // still water
    light!(10, 2),            // flowing lava
    light!(11, 2),            // still lava
    light!(18, 1, diffuses),  // leaves
    light!(20, 1),            // glass
    light!(26, 1),            // bed
    light!(27, 1),            // powered rail
    light!(28, 1),            // detector rail
    light!(30, 1, diffuses),  // cobweb
    light!(31, 1, diffuses),  // tall grass
    light!(32, 1, diffuses),  // dead bush
    light!(37, 1, diffuses),  // dandelion
    light!(38, 1, diffuses),  // poppy
    light!(39, 1),            // brown mushroom
    light!(40, 1),            // red mushroom
    light!(50, 1),            // torch
    light!(51, 1),            // fire
    light!(52, 1),            // monster spawner
    light!(59, 1, diffuses),  // wheat
    light!(63, 1),            // standing sign
    light!(64, 1),            // wooden door
    light!(65, 1),            // ladder
    light!(66, 1),            // rail
    light!(68, 1),            // wall sign
    light!(69, 1),            // lever
    light!(71, 1),            // iron door
    light!(76, 1),            // redstone torch
    light!(78, 1, diffuses),  // snow layer
    light!(79, 2),            // ice
    light!(81, 1),            // cactus
    light!(83, 1, diffuses),  // sugarcane
    light!(85, 1),            // fence
    light!(101, 1),           // iron bars
    light!(102, 1),           // glass pane
    light!(106, 1, diffuses), // vines
    light!(111, 1, diffuses), // lily pad
    light!(175, 1, diffuses), // double plant
];

/// Dense lookup tables over the full legacy id space.
pub struct BlockLightTable {
    light_filter: [u8; 256],
    diffuses_sky_light: [bool; 256],
}

impl Default for BlockLightTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockLightTable {
    pub fn new() -> Self {
        let mut light_filter = [15u8; 256];
        let mut diffuses_sky_light = [false; 256];
        for info in LIGHT_DATA {
            light_filter[info.id as usize] = info.filter;
            diffuses_sky_light[info.id as usize] = info.diffuses;
        }
        Self {
            light_filter,
            diffuses_sky_light,
        }
    }

    #[inline]
    pub fn light_filter(&self, id: u8) -> u8 {
        self.light_filter[id as usize]
    }

    #[inline]
    pub fn diffuses_sky_light(&self, id: u8) -> bool {
        self.diffuses_sky_light[id as usize]
    }

    /// Fully transparent and non-diffusing: sky light passes unchanged.
    #[inline]
    pub fn is_fully_transparent(&self, id: u8) -> bool {
        self.light_filter[id as usize] <= 1 && !self.diffuses_sky_light[id as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn air_is_fully_transparent() {
        let table = BlockLightTable::new();
        assert_eq!(table.light_filter(0), 1);
        assert!(!table.diffuses_sky_light(0));
        assert!(table.is_fully_transparent(0));
    }

    #[test]
    fn unknown_ids_are_opaque() {
        let table = BlockLightTable::new();
        assert_eq!(table.light_filter(1), 15); // stone
        assert_eq!(table.light_filter(255), 15);
        assert!(!table.is_fully_transparent(1));
    }

    #[test]
    fn leaves_diffuse_without_blocking() {
        let table = BlockLightTable::new();
        assert_eq!(table.light_filter(18), 1);
        assert!(table.diffuses_sky_light(18));
        assert!(!table.is_fully_transparent(18));
    }

    #[test]
    fn water_attenuates() {
        let table = BlockLightTable::new();
        assert_eq!(table.light_filter(9), 2);
        assert!(!table.is_fully_transparent(9));
    }
}
