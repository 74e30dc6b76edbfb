//! Swarm simulation driving the partition index

use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use spatial_partition::prelude::*;

/// Demo settings, loadable from TOML or RON
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Partition world and grid
    pub partition: PartitionConfig,
    /// Moving ships
    pub ships: u32,
    /// Static asteroids
    pub asteroids: u32,
    /// Presentation-only lights
    pub lights: u32,
    /// Simulation ticks to run
    pub ticks: u32,
    /// Query threads running beside the simulation thread
    pub workers: usize,
    /// Random seed
    pub seed: u64,
    /// Seconds per tick
    pub time_step: f32,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            partition: PartitionConfig::default(),
            ships: 2000,
            asteroids: 600,
            lights: 64,
            ticks: 300,
            workers: 4,
            seed: 7,
            time_step: 1.0 / 30.0,
        }
    }
}

impl Config for DemoConfig {}

/// What a partition entry stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Body {
    /// Index into the ship list
    Ship(u32),
    /// Asteroid id
    Asteroid(u32),
    /// Light id
    Light(u32),
}

const SHIP_LISTS: ListMask = PartitionLists::DYNAMIC;
const ASTEROID_LISTS: ListMask = PartitionLists::STATIC | PartitionLists::VISIBILITY;
const SENSOR_RANGE: f32 = 600.0;
const CONTACT_RADIUS: f32 = 400.0;
const RESPAWN_INTERVAL: u32 = 25;

#[derive(Debug, Clone, Copy)]
struct Ship {
    handle: PartitionHandle,
    position: Vec3,
    velocity: Vec3,
    half_size: Vec3,
}

#[derive(Debug, Clone, Copy)]
struct ShipView {
    id: u32,
    position: Vec3,
    heading: Vec3,
    half_size: Vec3,
}

/// Query results summed over a run
#[derive(Debug, Clone, Copy, Default)]
struct Contacts {
    nearby_ships: u64,
    nearby_asteroids: u64,
    sensor_hits: u64,
    lit: u64,
}

impl AddAssign for Contacts {
    fn add_assign(&mut self, other: Self) {
        self.nearby_ships += other.nearby_ships;
        self.nearby_asteroids += other.nearby_asteroids;
        self.sensor_hits += other.sensor_hits;
        self.lit += other.lit;
    }
}

#[derive(Debug, Default)]
struct QueryCounter {
    started: AtomicU64,
    finished: AtomicU64,
}

impl QueryCallback for QueryCounter {
    fn on_pre_query(&self, _list_mask: ListMask) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    fn on_post_query(&self, _list_mask: ListMask) {
        self.finished.fetch_add(1, Ordering::Relaxed);
    }
}

/// Ships, asteroids and lights sharing one index
pub struct Swarm {
    config: DemoConfig,
    index: PartitionIndex<Body>,
    ships: Vec<Ship>,
    asteroids: Vec<PartitionHandle>,
    next_asteroid: u32,
    rng: fastrand::Rng,
    counter: Arc<QueryCounter>,
    contacts: Contacts,
}

impl Swarm {
    /// Build the index and scatter every body
    pub fn new(config: DemoConfig) -> Result<Self, PartitionError> {
        let index = PartitionIndex::new(config.partition.clone())?;
        let counter = Arc::new(QueryCounter::default());
        index.install_query_callback(counter.clone())?;

        let mut swarm = Self {
            index,
            ships: Vec::with_capacity(config.ships as usize),
            asteroids: Vec::with_capacity(config.asteroids as usize),
            next_asteroid: 0,
            rng: fastrand::Rng::with_seed(config.seed),
            counter,
            contacts: Contacts::default(),
            config,
        };

        for _ in 0..swarm.config.asteroids {
            swarm.spawn_asteroid();
        }
        for id in 0..swarm.config.lights {
            let center = swarm.random_position(0.8);
            let half = Vec3::repeat(150.0 + swarm.rng.f32() * 600.0);
            swarm.index.create_handle_with(Body::Light(id), PartitionLists::LIGHTS, center - half, center + half);
        }
        for id in 0..swarm.config.ships {
            let position = swarm.random_position(0.9);
            let speed = 50.0 + swarm.rng.f32() * 350.0;
            let velocity = swarm.random_direction() * speed;
            let half_size = Vec3::repeat(10.0 + swarm.rng.f32() * 30.0);
            let handle = swarm
                .index
                .create_handle_with(Body::Ship(id), SHIP_LISTS, position - half_size, position + half_size);
            swarm.ships.push(Ship {
                handle,
                position,
                velocity,
                half_size,
            });
        }

        log::info!(
            "Swarm ready: {} ships, {} asteroids, {} lights",
            swarm.config.ships,
            swarm.config.asteroids,
            swarm.config.lights
        );
        Ok(swarm)
    }

    fn random_position(&mut self, fraction: f32) -> Vec3 {
        let world = self.config.partition.world_bounds();
        let center = world.center();
        let extents = world.extents() * fraction;
        Vec3::new(
            center.x + (self.rng.f32() * 2.0 - 1.0) * extents.x,
            center.y + (self.rng.f32() * 2.0 - 1.0) * extents.y,
            center.z + (self.rng.f32() * 2.0 - 1.0) * extents.z,
        )
    }

    fn random_direction(&mut self) -> Vec3 {
        loop {
            let v = Vec3::new(self.rng.f32() * 2.0 - 1.0, self.rng.f32() * 2.0 - 1.0, self.rng.f32() * 2.0 - 1.0);
            let length = v.norm();
            if length > 0.01 && length <= 1.0 {
                return v / length;
            }
        }
    }

    fn spawn_asteroid(&mut self) {
        let center = self.random_position(0.8);
        // Mostly rocks, a few huge ones that land on the coarse levels.
        let radius = if self.rng.u32(0..20) == 0 {
            2000.0 + self.rng.f32() * 6000.0
        } else {
            30.0 + self.rng.f32() * 400.0
        };
        let half = Vec3::repeat(radius);
        let id = self.next_asteroid;
        self.next_asteroid += 1;
        let handle = self.index.create_handle_with(Body::Asteroid(id), ASTEROID_LISTS, center - half, center + half);
        self.asteroids.push(handle);
    }

    /// Run every tick, moving ships on one thread while workers query
    pub fn run(&mut self) {
        let started = Instant::now();
        for tick in 0..self.config.ticks {
            let views: Vec<ShipView> = self
                .ships
                .iter()
                .zip(0..)
                .map(|(ship, id)| ShipView {
                    id,
                    position: ship.position,
                    heading: ship.velocity,
                    half_size: ship.half_size,
                })
                .collect();

            let tick_contacts = self.tick(&views);
            self.contacts += tick_contacts;

            if tick % RESPAWN_INTERVAL == RESPAWN_INTERVAL - 1 {
                self.respawn_asteroid();
            }
            if tick % 100 == 0 {
                log::info!("Tick {tick}: {tick_contacts:?}");
            } else {
                log::debug!("Tick {tick}: {tick_contacts:?}");
            }
        }
        log::info!("{} ticks in {:.2?}", self.config.ticks, started.elapsed());
    }

    fn tick(&mut self, views: &[ShipView]) -> Contacts {
        let workers = self.config.workers.max(1);
        let chunk = views.len().div_ceil(workers).max(1);
        let dt = self.config.time_step;
        let world = self.config.partition.world_bounds().expanded(-100.0);
        let index = &self.index;
        let ships = &mut self.ships;

        thread::scope(|scope| {
            scope.spawn(move || {
                for ship in ships.iter_mut() {
                    ship.position += ship.velocity * dt;
                    for axis in 0..3 {
                        if ship.position[axis] < world.min[axis] || ship.position[axis] > world.max[axis] {
                            ship.velocity[axis] = -ship.velocity[axis];
                            ship.position[axis] = ship.position[axis].clamp(world.min[axis], world.max[axis]);
                        }
                    }
                    index.element_moved(ship.handle, ship.position - ship.half_size, ship.position + ship.half_size);
                }
            });

            let handles: Vec<_> = views
                .chunks(chunk)
                .map(|slice| scope.spawn(move || scan_neighbourhood(index, slice)))
                .collect();

            let mut total = Contacts::default();
            for handle in handles {
                match handle.join() {
                    Ok(contacts) => total += contacts,
                    Err(payload) => std::panic::resume_unwind(payload),
                }
            }
            total
        })
    }

    /// Replace the oldest asteroid with a fresh one elsewhere
    fn respawn_asteroid(&mut self) {
        if self.asteroids.is_empty() {
            return;
        }
        let handle = self.asteroids.remove(0);
        if let Some(Body::Asteroid(id)) = self.index.owner(handle) {
            log::debug!("Respawning asteroid {id}");
        }
        self.index.destroy_handle(handle);
        self.spawn_asteroid();
    }

    /// Log totals and the partition occupancy
    pub fn report(&self) {
        let c = &self.contacts;
        log::info!(
            "Contacts: {} ship pairs, {} asteroid proximities, {} sensor hits, {} lit ships",
            c.nearby_ships,
            c.nearby_asteroids,
            c.sensor_hits,
            c.lit
        );
        log::info!(
            "Queries: {} started, {} finished",
            self.counter.started.load(Ordering::Relaxed),
            self.counter.finished.load(Ordering::Relaxed)
        );
        self.index.report_stats();
    }
}

/// Proximity, sensor sweep and lighting queries for a slice of ships
fn scan_neighbourhood(index: &PartitionIndex<Body>, ships: &[ShipView]) -> Contacts {
    let mut contacts = Contacts::default();
    for ship in ships {
        let sphere = BoundingSphere::new(ship.position, CONTACT_RADIUS);
        index.enumerate_in_sphere(SHIP_LISTS | ASTEROID_LISTS, &sphere, |body| {
            match body {
                Body::Ship(id) if id != ship.id => contacts.nearby_ships += 1,
                Body::Asteroid(_) => contacts.nearby_asteroids += 1,
                _ => {}
            }
            IterationControl::Continue
        });

        // Sweep the hull forward and stop at the first rock.
        let speed = ship.heading.norm();
        if speed > 0.0 {
            let end = ship.position + ship.heading * (SENSOR_RANGE / speed);
            let sweep = Ray::swept(ship.position, end, ship.half_size);
            index.enumerate_along_ray(PartitionLists::STATIC, &sweep, |_| {
                contacts.sensor_hits += 1;
                IterationControl::Stop
            });
        }

        index.enumerate_at_point(PartitionLists::LIGHTS, ship.position, |_| {
            contacts.lit += 1;
            IterationControl::Stop
        });
    }
    contacts
}
