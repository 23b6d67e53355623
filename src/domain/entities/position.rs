use super::order::OrderSide;

/// Quantities smaller than this are treated as a flat position.
const FLAT_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
            PositionSide::Flat => write!(f, "FLAT"),
        }
    }
}

/// Running aggregate for one (account, instrument).
///
/// `quantity` is signed: positive for long, negative for short. This is a cached view
/// over the journal, not the system of record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub quantity: f64,
    pub average_entry_price: f64,
    pub initial_stop: Option<f64>,
}

impl Position {
    pub fn flat() -> Self {
        Self {
            quantity: 0.0,
            average_entry_price: 0.0,
            initial_stop: None,
        }
    }

    pub fn side(&self) -> PositionSide {
        if self.quantity.abs() < FLAT_EPSILON {
            PositionSide::Flat
        } else if self.quantity > 0.0 {
            PositionSide::Long
        } else {
            PositionSide::Short
        }
    }

    /// Apply a fill and return the realized PnL it produced.
    ///
    /// Fills in the direction of the position (or from flat) re-average the entry
    /// price. Opposing fills realize PnL on the closed part; any excess opens a new
    /// position on the other side at the fill price. `stop` becomes the initial stop
    /// whenever a position is opened from flat or flipped.
    pub fn apply_fill(
        &mut self,
        side: OrderSide,
        quantity: f64,
        price: f64,
        stop: Option<f64>,
    ) -> f64 {
        let delta = side.sign() * quantity;
        let current = self.side();

        let increases = match current {
            PositionSide::Flat => true,
            PositionSide::Long => delta > 0.0,
            PositionSide::Short => delta < 0.0,
        };

        if increases {
            let held = self.quantity.abs();
            self.average_entry_price =
                (held * self.average_entry_price + quantity * price) / (held + quantity);
            if current == PositionSide::Flat {
                self.initial_stop = stop;
            }
            self.quantity += delta;
            return 0.0;
        }

        let held = self.quantity.abs();
        let closed = held.min(quantity);
        let direction = self.quantity.signum();
        let realized = (price - self.average_entry_price) * closed * direction;

        self.quantity += delta;
        match self.side() {
            PositionSide::Flat => {
                *self = Position::flat();
            }
            side_after if side_after != current => {
                // Flipped through zero: the remainder is a fresh position.
                self.average_entry_price = price;
                self.initial_stop = stop;
            }
            _ => {}
        }

        realized
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::flat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_open_long_from_flat_sets_stop() {
        let mut position = Position::flat();
        let pnl = position.apply_fill(OrderSide::Buy, 0.5, 60000.0, Some(58200.0));
        assert_eq!(pnl, 0.0);
        assert_eq!(position.side(), PositionSide::Long);
        assert!(approx(position.quantity, 0.5));
        assert!(approx(position.average_entry_price, 60000.0));
        assert_eq!(position.initial_stop, Some(58200.0));
    }

    #[test]
    fn test_adding_reaverages_and_keeps_stop() {
        let mut position = Position::flat();
        position.apply_fill(OrderSide::Buy, 1.0, 100.0, Some(95.0));
        position.apply_fill(OrderSide::Buy, 1.0, 110.0, Some(50.0));
        assert!(approx(position.quantity, 2.0));
        assert!(approx(position.average_entry_price, 105.0));
        assert_eq!(position.initial_stop, Some(95.0));
    }

    #[test]
    fn test_partial_close_realizes_pnl() {
        let mut position = Position::flat();
        position.apply_fill(OrderSide::Buy, 2.0, 100.0, None);
        let pnl = position.apply_fill(OrderSide::Sell, 0.5, 120.0, None);
        assert!(approx(pnl, 10.0));
        assert!(approx(position.quantity, 1.5));
        assert!(approx(position.average_entry_price, 100.0));
    }

    #[test]
    fn test_short_close_realizes_pnl() {
        let mut position = Position::flat();
        position.apply_fill(OrderSide::Sell, 1.0, 100.0, Some(103.0));
        assert_eq!(position.side(), PositionSide::Short);
        let pnl = position.apply_fill(OrderSide::Buy, 1.0, 90.0, None);
        assert!(approx(pnl, 10.0));
        assert_eq!(position, Position::flat());
    }

    #[test]
    fn test_flip_opens_remainder_at_fill_price() {
        let mut position = Position::flat();
        position.apply_fill(OrderSide::Buy, 1.0, 100.0, Some(97.0));
        let pnl = position.apply_fill(OrderSide::Sell, 3.0, 90.0, Some(93.0));
        assert!(approx(pnl, -10.0));
        assert_eq!(position.side(), PositionSide::Short);
        assert!(approx(position.quantity, -2.0));
        assert!(approx(position.average_entry_price, 90.0));
        assert_eq!(position.initial_stop, Some(93.0));
    }
}
